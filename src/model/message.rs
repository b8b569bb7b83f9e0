use bytes::Bytes;
use chrono::{DateTime, Utc};
use mqbridge_client::{Header, MqMessage, ProduceRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    Mq,
    Kafka,
}

/// Where a message came from, precise enough to find it again after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "system", rename_all = "snake_case")]
pub enum SourceOffset {
    Mq {
        queue: String,
        #[serde(with = "hex_bytes")]
        message_id: Bytes,
    },
    Kafka {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOffset::Mq { queue, message_id } => {
                write!(f, "mq:{}/{}", queue, hex(message_id))
            }
            SourceOffset::Kafka {
                topic,
                partition,
                offset,
            } => write!(f, "kafka:{}/{}@{}", topic, partition, offset),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !s.is_ascii() {
            return Err(serde::de::Error::custom("hex string contains non-ASCII characters"));
        }
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd length hex string"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// The canonical form every message takes between its origin and destination.
///
/// `key` is the destination's key field: the record key when heading to Kafka,
/// the correlation ID when heading to MQ. Fields are private so the payload
/// cannot change after creation; stages that need a different message build
/// a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMessage {
    payload: Bytes,
    key: Option<Bytes>,
    headers: Vec<Header>,
    source_system: SourceSystem,
    source_offset: SourceOffset,
    received_at: DateTime<Utc>,
}

impl BridgeMessage {
    pub fn new(
        payload: Bytes,
        key: Option<Bytes>,
        headers: Vec<Header>,
        source_offset: SourceOffset,
    ) -> Self {
        let source_system = match source_offset {
            SourceOffset::Mq { .. } => SourceSystem::Mq,
            SourceOffset::Kafka { .. } => SourceSystem::Kafka,
        };
        Self {
            payload,
            key,
            headers,
            source_system,
            source_offset,
            received_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn source_system(&self) -> SourceSystem {
        self.source_system
    }

    pub fn source_offset(&self) -> &SourceOffset {
        &self.source_offset
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Same payload and origin with additional headers appended.
    pub fn with_appended_headers(&self, extra: impl IntoIterator<Item = Header>) -> Self {
        let mut headers = self.headers.clone();
        headers.extend(extra);
        Self {
            headers,
            ..self.clone()
        }
    }

    pub fn to_produce_record(&self, topic: &str) -> ProduceRecord {
        ProduceRecord {
            topic: topic.to_string(),
            key: self.key.clone(),
            value: self.payload.clone(),
            headers: self.headers.clone(),
        }
    }

    pub fn to_mq_message(&self) -> MqMessage {
        MqMessage {
            correlation_id: self.key.clone(),
            properties: self.headers.clone(),
            ..MqMessage::new(self.payload.clone())
        }
    }
}
