//! Where messages go once they have used up their retries.

use bytes::Bytes;
use mqbridge_client::mq::CORREL_ID_LENGTH;
use mqbridge_client::{
    Classify, ErrorClass, Header, KafkaProducer, MqMessage, MqSession, ProduceRecord,
};
use std::sync::Arc;
use tracing::warn;

use super::EngineError;
use crate::model::config::DeadLetterConfig;

// MQ reserves property names starting with "mq", so these stay outside it.
pub const REASON_HEADER: &str = "bridge.dead.letter.reason";
pub const ORIGIN_HEADER: &str = "bridge.dead.letter.origin";
/// Holds a Kafka key too long to fit in a correlation ID.
pub const KEY_HEADER: &str = "bridge.dead.letter.key";

/// Sends dead letters to the topic when one is configured, otherwise to the
/// dead-letter queue. The queue also takes whatever the topic rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterWriter {
    queue: String,
    topic: Option<String>,
}

impl DeadLetterWriter {
    pub fn from_config(config: &DeadLetterConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            topic: config.topic.clone(),
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Writes within the caller's MQ unit of work. A dead letter neither
    /// destination accepts is fatal: committing would lose the message and
    /// backing out would replay it forever.
    pub async fn write(
        &self,
        session: &mut Box<dyn MqSession>,
        producer: Option<&Arc<dyn KafkaProducer>>,
        dead_letter: DeadLetter,
    ) -> Result<(), EngineError> {
        if let (Some(topic), Some(producer)) = (&self.topic, producer) {
            warn!(
                "Dead-lettering {} to topic {}: {}",
                dead_letter.origin, topic, dead_letter.reason
            );
            match producer.produce(dead_letter.to_produce_record(topic)).await {
                Ok(_) => return Ok(()),
                Err(e) if e.class() == ErrorClass::Poison => {
                    warn!(
                        "Dead-letter topic {} rejected {}: {}; falling back to {}",
                        topic, dead_letter.origin, e, self.queue
                    );
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            warn!(
                "Dead-lettering {} to queue {}: {}",
                dead_letter.origin, self.queue, dead_letter.reason
            );
        }

        match session.put(&self.queue, dead_letter.to_mq_message()).await {
            Ok(()) => Ok(()),
            Err(e) if e.class() == ErrorClass::Poison => Err(EngineError::DeadLetterRejected {
                origin: dead_letter.origin,
                reason: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// A message that could not be delivered, with its original content untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: Bytes,
    pub key: Option<Bytes>,
    pub headers: Vec<Header>,
    pub reason: String,
    /// The origin position, e.g. `mq:KAFKA.IN/<message id>`.
    pub origin: String,
}

impl DeadLetter {
    fn annotated_headers(&self) -> Vec<Header> {
        let mut headers = self.headers.clone();
        headers.push(Header::new(REASON_HEADER, self.reason.clone()));
        headers.push(Header::new(ORIGIN_HEADER, self.origin.clone()));
        headers
    }

    pub fn to_mq_message(&self) -> MqMessage {
        let mut properties = self.annotated_headers();
        let correlation_id = match &self.key {
            Some(key) if key.len() > CORREL_ID_LENGTH => {
                properties.push(Header::new(KEY_HEADER, key.clone()));
                None
            }
            key => key.clone(),
        };
        MqMessage {
            correlation_id,
            properties,
            ..MqMessage::new(self.payload.clone())
        }
    }

    pub fn to_produce_record(&self, topic: &str) -> ProduceRecord {
        ProduceRecord {
            topic: topic.to_string(),
            key: self.key.clone(),
            value: self.payload.clone(),
            headers: self.annotated_headers(),
        }
    }
}
