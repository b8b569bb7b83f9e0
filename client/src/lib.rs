//! Transport adapters for the MQ <-> Kafka bridge.
//!
//! Both sides expose the same shape: a connector that opens sessions from a
//! typed config, a session trait with explicit commit control, and an error
//! type that classifies every failure as transient, poison or fatal so the
//! engines never have to inspect error strings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod kafka;
pub mod mq;

pub use kafka::{
    CommitHandle, DeliveryReceipt, KafkaConfig, KafkaConnector, KafkaConsumer, KafkaError,
    KafkaProducer, KafkaRecord, ProduceRecord, SecurityProtocol,
};
pub use mq::{GetOutcome, MqConfig, MqConnector, MqError, MqMessage, MqSession, MqTransport};

/// How a failure should be handled by whoever owns the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blips, unavailable brokers, quiescing queue managers. Retry with backoff.
    Transient,
    /// The message itself cannot be delivered. Retry a bounded number of times, then dead-letter.
    Poison,
    /// Bad credentials, missing queue or topic. Stop and wait for an operator.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Poison => write!(f, "poison"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors that know their own [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// A single message property / record header.
///
/// Names are strings on both sides of the bridge, values are carried as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Looks up the first header with the given name.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|h| h.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_returns_first_match() {
        let headers = vec![
            Header::new("a", "1"),
            Header::new("b", "2"),
            Header::new("a", "3"),
        ];

        assert_eq!(find_header(&headers, "a").unwrap().value, Bytes::from("1"));
        assert!(find_header(&headers, "c").is_none());
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
        assert_eq!(ErrorClass::Poison.to_string(), "poison");
        assert_eq!(ErrorClass::Fatal.to_string(), "fatal");
    }
}
