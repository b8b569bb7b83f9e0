//! Kafka side of the bridge.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::{Classify, ErrorClass, Header};

pub mod memory;
pub mod rd;

pub use memory::InMemoryCluster;
pub use rd::RdKafkaConnector;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KafkaError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Produce timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Client configuration error: {0}")]
    Config(String),

    #[error("Kafka error ({class}): {message}")]
    Client { class: ErrorClass, message: String },
}

impl Classify for KafkaError {
    fn class(&self) -> ErrorClass {
        match self {
            KafkaError::Unavailable(_) | KafkaError::Timeout(_) => ErrorClass::Transient,
            KafkaError::MessageTooLarge { .. } => ErrorClass::Poison,
            KafkaError::UnknownTopic(_) | KafkaError::NotAuthorized(_) | KafkaError::Config(_) => {
                ErrorClass::Fatal
            }
            KafkaError::Client { class, .. } => *class,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProtocol {
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
    #[serde(rename = "SSL")]
    Ssl,
    #[serde(rename = "SASL_PLAINTEXT")]
    SaslPlaintext,
    #[serde(rename = "SASL_SSL")]
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, SecurityProtocol::Ssl | SecurityProtocol::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SSL" => Ok(SecurityProtocol::Ssl),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            other => Err(format!("unknown security protocol '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    pub security_protocol: SecurityProtocol,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// PEM bundle of trusted CA certificates.
    pub ssl_ca_location: Option<String>,
    /// How long a produce may wait for an acknowledgment from all in-sync replicas.
    pub produce_timeout: Duration,
    pub session_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "mqbridge".to_string(),
            security_protocol: SecurityProtocol::Plaintext,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            produce_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(6),
            max_message_bytes: 1024 * 1024,
        }
    }
}

/// A record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// `None` for tombstones.
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    pub timestamp: Option<i64>,
}

impl KafkaRecord {
    pub fn handle(&self) -> CommitHandle {
        CommitHandle {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Position of a consumed record, used to commit or rewind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitHandle {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
}

impl ProduceRecord {
    /// Key, value and header bytes; what `max_message_bytes` is checked against.
    pub fn size(&self) -> usize {
        self.value.len()
            + self.key.as_ref().map_or(0, Bytes::len)
            + self
                .headers
                .iter()
                .map(|h| h.name.len() + h.value.len())
                .sum::<usize>()
    }
}

/// Where a produced record landed once every in-sync replica acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait KafkaProducer: Send + Sync {
    /// Publishes one record and resolves once it is durably acknowledged.
    async fn produce(&self, record: ProduceRecord) -> Result<DeliveryReceipt, KafkaError>;

    async fn flush(&self, timeout: Duration) -> Result<(), KafkaError>;
}

/// A group member reading one topic. Offsets are only ever committed explicitly.
#[async_trait]
pub trait KafkaConsumer: Send + Sync {
    /// Next record, or `None` when nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<KafkaRecord>, KafkaError>;

    /// Commits `offset + 1` for the highest handle of every partition.
    async fn commit(&mut self, handles: &[CommitHandle]) -> Result<(), KafkaError>;

    /// Moves every partition back to its earliest handle so those records are delivered again.
    async fn rewind(&mut self, handles: &[CommitHandle]) -> Result<(), KafkaError>;
}

#[async_trait]
pub trait KafkaConnector: Send + Sync {
    async fn producer(&self, config: &KafkaConfig) -> Result<Arc<dyn KafkaProducer>, KafkaError>;

    async fn consume(
        &self,
        config: &KafkaConfig,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn KafkaConsumer>, KafkaError>;
}

/// Offsets to commit: one past the highest handle per (topic, partition).
pub fn next_offsets(handles: &[CommitHandle]) -> BTreeMap<(String, i32), i64> {
    let mut offsets = BTreeMap::new();
    for handle in handles {
        let next = handle.offset + 1;
        offsets
            .entry((handle.topic.clone(), handle.partition))
            .and_modify(|o: &mut i64| *o = (*o).max(next))
            .or_insert(next);
    }
    offsets
}

/// Positions to seek back to: the lowest handle per (topic, partition).
pub fn earliest_offsets(handles: &[CommitHandle]) -> BTreeMap<(String, i32), i64> {
    let mut offsets = BTreeMap::new();
    for handle in handles {
        offsets
            .entry((handle.topic.clone(), handle.partition))
            .and_modify(|o: &mut i64| *o = (*o).min(handle.offset))
            .or_insert(handle.offset);
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(topic: &str, partition: i32, offset: i64) -> CommitHandle {
        CommitHandle {
            topic: topic.to_string(),
            partition,
            offset,
        }
    }

    #[test]
    fn test_next_offsets_takes_highest_per_partition() {
        let handles = vec![
            handle("t", 0, 5),
            handle("t", 0, 7),
            handle("t", 1, 2),
            handle("u", 0, 9),
        ];

        let offsets = next_offsets(&handles);
        assert_eq!(offsets[&("t".to_string(), 0)], 8);
        assert_eq!(offsets[&("t".to_string(), 1)], 3);
        assert_eq!(offsets[&("u".to_string(), 0)], 10);
    }

    #[test]
    fn test_earliest_offsets_takes_lowest_per_partition() {
        let handles = vec![handle("t", 0, 7), handle("t", 0, 5), handle("t", 1, 2)];

        let offsets = earliest_offsets(&handles);
        assert_eq!(offsets[&("t".to_string(), 0)], 5);
        assert_eq!(offsets[&("t".to_string(), 1)], 2);
    }

    #[test]
    fn test_produce_record_size_counts_key_and_headers() {
        let record = ProduceRecord {
            topic: "t".to_string(),
            key: Some(Bytes::from("key")),
            value: Bytes::from("value"),
            headers: vec![Header::new("h1", "abc"), Header::new("h2", "")],
        };

        assert_eq!(record.size(), 3 + 5 + 2 + 3 + 2);
    }

    #[test]
    fn test_security_protocol_parsing() {
        let protocol: SecurityProtocol = "sasl_ssl".parse().unwrap();
        assert_eq!(protocol, SecurityProtocol::SaslSsl);
        assert!(protocol.uses_sasl());
        assert!(protocol.uses_tls());
        assert_eq!(protocol.as_str(), "SASL_SSL");
        assert!("KERBEROS".parse::<SecurityProtocol>().is_err());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            KafkaError::Timeout(Duration::from_secs(1)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            KafkaError::UnknownTopic("t".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            KafkaError::MessageTooLarge { size: 2, max: 1 }.class(),
            ErrorClass::Poison
        );
        assert_eq!(
            KafkaError::Client {
                class: ErrorClass::Poison,
                message: "x".into()
            }
            .class(),
            ErrorClass::Poison
        );
    }
}
