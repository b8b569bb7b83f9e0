//! Mapping between MQ messages, Kafka records and [`BridgeMessage`].
//!
//! Payloads and header bytes pass through untouched. The only field that
//! changes shape is the key: by default the MQ correlation ID is the Kafka
//! key; with `key.source.header` set, a message property supplies the key and
//! the correlation ID rides along in [`CORRELATION_ID_HEADER`].

use bytes::Bytes;
use mqbridge_client::mq::CORREL_ID_LENGTH;
use mqbridge_client::{find_header, Classify, ErrorClass, Header, KafkaRecord, MqMessage};
use thiserror::Error;

use crate::model::config::TranslatorConfig;
use crate::model::message::{BridgeMessage, SourceOffset};

/// Carries the MQ correlation ID through Kafka when the key comes from a property.
pub const CORRELATION_ID_HEADER: &str = "mq.correlation.id";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("Header name must not be empty")]
    EmptyHeaderName,

    #[error("Header '{name}' value is {size} bytes, limit is {max}")]
    HeaderValueTooLarge { name: String, size: usize, max: usize },

    #[error("Message is {size} bytes with headers, destination limit is {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Record {topic}/{partition}@{offset} has no value")]
    Tombstone {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Correlation ID is {size} bytes, MQ allows at most {max}", max = CORREL_ID_LENGTH)]
    CorrelationIdTooLong { size: usize },

    #[error("Property '{0}' collides with a header reserved by the bridge")]
    ReservedHeader(String),
}

impl Classify for TranslateError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Poison
    }
}

fn check_headers(headers: &[Header], config: &TranslatorConfig) -> Result<(), TranslateError> {
    for header in headers {
        if header.name.is_empty() {
            return Err(TranslateError::EmptyHeaderName);
        }
        if header.value.len() > config.header_value_max_bytes {
            return Err(TranslateError::HeaderValueTooLarge {
                name: header.name.clone(),
                size: header.value.len(),
                max: config.header_value_max_bytes,
            });
        }
    }
    Ok(())
}

/// Counts payload, key and header bytes, as the client adapters do before sending.
fn check_size(
    payload: &Bytes,
    key: Option<&Bytes>,
    headers: &[Header],
    max: usize,
) -> Result<(), TranslateError> {
    let size = payload.len()
        + key.map_or(0, Bytes::len)
        + headers
            .iter()
            .map(|h| h.name.len() + h.value.len())
            .sum::<usize>();
    if size > max {
        return Err(TranslateError::MessageTooLarge { size, max });
    }
    Ok(())
}

fn check_correlation_id(id: &Bytes) -> Result<(), TranslateError> {
    if id.len() > CORREL_ID_LENGTH {
        return Err(TranslateError::CorrelationIdTooLong { size: id.len() });
    }
    Ok(())
}

/// Translates a message read from `queue` into one headed for Kafka.
pub fn to_kafka(
    message: &MqMessage,
    queue: &str,
    config: &TranslatorConfig,
) -> Result<BridgeMessage, TranslateError> {
    check_headers(&message.properties, config)?;
    if let Some(id) = &message.correlation_id {
        check_correlation_id(id)?;
    }

    let mut headers = message.properties.clone();
    let key = match &config.key_source_header {
        None => message.correlation_id.clone(),
        Some(key_header) => {
            if find_header(&headers, CORRELATION_ID_HEADER).is_some() {
                return Err(TranslateError::ReservedHeader(
                    CORRELATION_ID_HEADER.to_string(),
                ));
            }
            let key = find_header(&headers, key_header).map(|h| h.value.clone());
            if let Some(id) = &message.correlation_id {
                headers.push(Header::new(CORRELATION_ID_HEADER, id.clone()));
            }
            key
        }
    };
    check_size(
        &message.payload,
        key.as_ref(),
        &headers,
        config.kafka_max_message_bytes,
    )?;

    Ok(BridgeMessage::new(
        message.payload.clone(),
        key,
        headers,
        SourceOffset::Mq {
            queue: queue.to_string(),
            message_id: message.message_id.clone(),
        },
    ))
}

/// Translates a consumed record into one headed for MQ.
pub fn to_mq(
    record: &KafkaRecord,
    config: &TranslatorConfig,
) -> Result<BridgeMessage, TranslateError> {
    let payload = record.value.clone().ok_or_else(|| TranslateError::Tombstone {
        topic: record.topic.clone(),
        partition: record.partition,
        offset: record.offset,
    })?;
    check_headers(&record.headers, config)?;

    let (correlation_id, headers) = match &config.key_source_header {
        None => (record.key.clone(), record.headers.clone()),
        Some(key_header) => {
            let correlation_id = find_header(&record.headers, CORRELATION_ID_HEADER)
                .map(|h| h.value.clone());
            let mut headers: Vec<Header> = record
                .headers
                .iter()
                .filter(|h| h.name != CORRELATION_ID_HEADER)
                .cloned()
                .collect();
            if let Some(key) = &record.key {
                if find_header(&headers, key_header).is_none() {
                    if key.len() > config.header_value_max_bytes {
                        return Err(TranslateError::HeaderValueTooLarge {
                            name: key_header.clone(),
                            size: key.len(),
                            max: config.header_value_max_bytes,
                        });
                    }
                    headers.push(Header::new(key_header.clone(), key.clone()));
                }
            }
            (correlation_id, headers)
        }
    };
    if let Some(id) = &correlation_id {
        check_correlation_id(id)?;
    }
    // The correlation ID lives in the MQMD, not in the message data.
    check_size(&payload, None, &headers, config.mq_max_message_bytes)?;

    Ok(BridgeMessage::new(
        payload,
        correlation_id,
        headers,
        SourceOffset::Kafka {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        },
    ))
}
