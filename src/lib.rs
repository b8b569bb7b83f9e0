//! Bidirectional, at-least-once bridge between IBM MQ queues and Kafka topics.
//!
//! The [`supervisor`] runs one [`engine::SourceEngine`] (MQ -> Kafka) and one
//! [`engine::SinkEngine`] (Kafka -> MQ) per configured task, restarts them
//! after transient failures and publishes their status to [`health`].

pub mod concurrency;
pub mod engine;
pub mod generator;
pub mod health;
pub mod model;
pub mod stages;
pub mod supervisor;
pub mod translator;

pub use model::config::{BridgeConfig, ConfigError};
pub use model::message::{BridgeMessage, SourceOffset, SourceSystem};
pub use supervisor::{BridgeSupervisor, SupervisorError};
