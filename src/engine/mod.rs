//! The two bridge directions and what they share.
//!
//! An engine owns its connections and runs one unit of work per [`Engine::step`]:
//! read a batch from the origin, translate it, hand it to the destination,
//! commit the destination, then commit the origin. Anything that goes wrong
//! before the origin commit leaves the batch to be redelivered by the origin.

use async_trait::async_trait;
use mqbridge_client::{Classify, ErrorClass, KafkaError, MqError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::stages::StageError;
use crate::translator::TranslateError;

pub mod dead_letter;
pub mod sink;
pub mod source;

pub use sink::SinkEngine;
pub use source::SourceEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// MQ -> Kafka
    Source,
    /// Kafka -> MQ
    Sink,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Source => write!(f, "source"),
            EngineKind::Sink => write!(f, "sink"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Connecting,
    Idle,
    Polling,
    Consuming,
    Translating,
    Publishing,
    Putting,
    Committing,
    /// Waiting out the restart backoff.
    Restarting,
    Stopped,
    Failed,
}

impl EngineState {
    /// States an engine passes through for every message.
    pub fn is_pipeline_step(&self) -> bool {
        matches!(
            self,
            EngineState::Polling
                | EngineState::Consuming
                | EngineState::Translating
                | EngineState::Publishing
                | EngineState::Putting
                | EngineState::Committing
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Connecting => "connecting",
            EngineState::Idle => "idle",
            EngineState::Polling => "polling",
            EngineState::Consuming => "consuming",
            EngineState::Translating => "translating",
            EngineState::Publishing => "publishing",
            EngineState::Putting => "putting",
            EngineState::Committing => "committing",
            EngineState::Restarting => "restarting",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("MQ error: {0}")]
    Mq(#[from] MqError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Dead letter for {origin} was rejected: {reason}")]
    DeadLetterRejected { origin: String, reason: String },
}

impl Classify for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            EngineError::Mq(e) => e.class(),
            EngineError::Kafka(e) => e.class(),
            EngineError::Translate(e) => e.class(),
            EngineError::Stage(e) => e.class(),
            EngineError::DeadLetterRejected { .. } => ErrorClass::Fatal,
        }
    }
}

/// What one unit of work achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived within the poll timeout.
    Idle,
    /// The batch was committed.
    Transferred { delivered: usize, dead_lettered: usize },
    /// A poison message was handed back to the origin for another attempt.
    Retried,
}

#[async_trait]
pub trait Engine: Send {
    fn kind(&self) -> EngineKind;

    /// Opens fresh connections, replacing any left from a previous attempt.
    async fn connect(&mut self) -> Result<(), EngineError>;

    async fn step(&mut self) -> Result<StepOutcome, EngineError>;

    /// Backs out anything uncommitted and drops the connections.
    async fn disconnect(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{watch, Notify};

    use crate::health::{EngineStatus, HealthReporter};
    use crate::model::config::BridgeConfig;
    use mqbridge_client::kafka::InMemoryCluster;
    use mqbridge_client::mq::InMemoryQueueManager;
    use mqbridge_client::{
        GetOutcome, MqConfig, MqConnector, MqError, MqMessage, MqSession, MqTransport,
    };

    use super::EngineKind;

    pub fn config(json: &str) -> BridgeConfig {
        let mut config = BridgeConfig::from_json_str(json).unwrap();
        config.mq.transport = MqTransport::Memory;
        config
    }

    pub fn queue_manager() -> Arc<InMemoryQueueManager> {
        let qm = Arc::new(InMemoryQueueManager::new("QM1"));
        for queue in ["KAFKA.IN", "KAFKA.OUT", "SYSTEM.DEAD.LETTER.QUEUE"] {
            qm.define_queue(queue);
        }
        qm
    }

    pub fn cluster() -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        for topic in ["mq-messages-in", "mq-messages-out", "mq-bridge-dlt"] {
            cluster.create_topic(topic, 3);
        }
        cluster
    }

    pub fn reporter(kind: EngineKind) -> (HealthReporter, watch::Receiver<EngineStatus>) {
        HealthReporter::new(format!("{kind}-0"), kind)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Crash {
        /// The MQ unit of work is still open.
        BeforeMqCommit,
        /// MQ has committed; nothing after it has run.
        AfterMqCommit,
    }

    /// Hands out sessions whose first commit never returns, as if the
    /// process died at that point. `crashed` fires when it happens.
    pub struct CrashingQueueManager {
        inner: Arc<InMemoryQueueManager>,
        crash: Crash,
        armed: Arc<AtomicBool>,
        pub crashed: Arc<Notify>,
    }

    impl CrashingQueueManager {
        pub fn new(inner: Arc<InMemoryQueueManager>, crash: Crash) -> Self {
            Self {
                inner,
                crash,
                armed: Arc::new(AtomicBool::new(true)),
                crashed: Arc::new(Notify::new()),
            }
        }
    }

    #[async_trait]
    impl MqConnector for CrashingQueueManager {
        async fn connect(&self, config: &MqConfig) -> Result<Box<dyn MqSession>, MqError> {
            Ok(Box::new(CrashingSession {
                inner: self.inner.connect(config).await?,
                crash: self.crash,
                armed: Arc::clone(&self.armed),
                crashed: Arc::clone(&self.crashed),
            }))
        }
    }

    struct CrashingSession {
        inner: Box<dyn MqSession>,
        crash: Crash,
        armed: Arc<AtomicBool>,
        crashed: Arc<Notify>,
    }

    #[async_trait]
    impl MqSession for CrashingSession {
        async fn get_next(&mut self, queue: &str, wait: Duration) -> Result<GetOutcome, MqError> {
            self.inner.get_next(queue, wait).await
        }

        async fn put(&mut self, queue: &str, message: MqMessage) -> Result<(), MqError> {
            self.inner.put(queue, message).await
        }

        async fn commit(&mut self) -> Result<(), MqError> {
            if !self.armed.swap(false, Ordering::SeqCst) {
                return self.inner.commit().await;
            }
            if self.crash == Crash::AfterMqCommit {
                self.inner.commit().await?;
            }
            self.crashed.notify_one();
            std::future::pending().await
        }

        async fn backout(&mut self) -> Result<(), MqError> {
            self.inner.backout().await
        }

        fn in_transaction(&self) -> bool {
            self.inner.in_transaction()
        }
    }
}
