//! librdkafka-backed producer and consumer.

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header as RdHeader, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{
    earliest_offsets, next_offsets, CommitHandle, DeliveryReceipt, KafkaConfig, KafkaConnector,
    KafkaConsumer, KafkaError, KafkaProducer, KafkaRecord, ProduceRecord,
};
use crate::{ErrorClass, Header};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps a librdkafka error code onto the bridge's retry policy.
pub fn classify_code(code: RDKafkaErrorCode) -> ErrorClass {
    match code {
        RDKafkaErrorCode::MessageSizeTooLarge => ErrorClass::Poison,
        RDKafkaErrorCode::TopicAuthorizationFailed
        | RDKafkaErrorCode::GroupAuthorizationFailed
        | RDKafkaErrorCode::ClusterAuthorizationFailed
        | RDKafkaErrorCode::SaslAuthenticationFailed
        | RDKafkaErrorCode::Authentication
        | RDKafkaErrorCode::UnknownTopicOrPartition
        | RDKafkaErrorCode::UnknownTopic => ErrorClass::Fatal,
        _ => ErrorClass::Transient,
    }
}

impl From<RdKafkaError> for KafkaError {
    fn from(err: RdKafkaError) -> Self {
        match &err {
            RdKafkaError::ClientConfig(_, _, _, msg) => KafkaError::Config(msg.clone()),
            RdKafkaError::ClientCreation(msg) => KafkaError::Config(msg.clone()),
            _ => {
                let class = err
                    .rdkafka_error_code()
                    .map(classify_code)
                    .unwrap_or(ErrorClass::Transient);
                KafkaError::Client {
                    class,
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Settings shared by producers and consumers.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("security.protocol", config.security_protocol.as_str())
        .set("message.max.bytes", config.max_message_bytes.to_string());

    if config.security_protocol.uses_sasl() {
        if let Some(mechanism) = &config.sasl_mechanism {
            client.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &config.sasl_username {
            client.set("sasl.username", username);
        }
        if let Some(password) = &config.sasl_password {
            client.set("sasl.password", password);
        }
    }
    if config.security_protocol.uses_tls() {
        if let Some(ca) = &config.ssl_ca_location {
            client.set("ssl.ca.location", ca);
        }
    }
    client
}

fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = client_config(config);
    client
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set(
            "message.timeout.ms",
            config.produce_timeout.as_millis().to_string(),
        );
    client
}

fn consumer_config(config: &KafkaConfig, group_id: &str) -> ClientConfig {
    let mut client = client_config(config);
    client
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set(
            "session.timeout.ms",
            config.session_timeout.as_millis().to_string(),
        );
    client
}

pub struct RdKafkaConnector;

#[async_trait]
impl KafkaConnector for RdKafkaConnector {
    async fn producer(&self, config: &KafkaConfig) -> Result<Arc<dyn KafkaProducer>, KafkaError> {
        info!(
            "Creating Kafka producer with brokers: {}",
            config.bootstrap_servers
        );
        let inner: FutureProducer = producer_config(config).create()?;
        Ok(Arc::new(RdKafkaProducer {
            inner,
            queue_timeout: config.produce_timeout,
        }))
    }

    async fn consume(
        &self,
        config: &KafkaConfig,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn KafkaConsumer>, KafkaError> {
        info!(
            "Creating Kafka consumer with brokers: {}, group: {}, topic: {}",
            config.bootstrap_servers, group_id, topic
        );
        let inner: StreamConsumer = consumer_config(config, group_id).create()?;
        inner.subscribe(&[topic])?;
        Ok(Box::new(RdKafkaConsumer { inner }))
    }
}

pub struct RdKafkaProducer {
    inner: FutureProducer,
    queue_timeout: Duration,
}

#[async_trait]
impl KafkaProducer for RdKafkaProducer {
    async fn produce(&self, record: ProduceRecord) -> Result<DeliveryReceipt, KafkaError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for header in &record.headers {
            headers = headers.insert(RdHeader {
                key: header.name.as_str(),
                value: Some(header.value.as_ref()),
            });
        }

        let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic)
            .payload(record.value.as_ref())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self.inner.send(future_record, self.queue_timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    "Message sent to topic '{}' (partition: {}, offset: {})",
                    record.topic, partition, offset
                );
                Ok(DeliveryReceipt {
                    topic: record.topic,
                    partition,
                    offset,
                })
            }
            Err((err, _)) => {
                error!("Failed to send message to topic '{}': {}", record.topic, err);
                Err(err.into())
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        Producer::flush(&self.inner, timeout)?;
        Ok(())
    }
}

pub struct RdKafkaConsumer {
    inner: StreamConsumer,
}

fn to_record(message: &BorrowedMessage<'_>) -> KafkaRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| Header::new(h.key, Bytes::copy_from_slice(h.value.unwrap_or_default())))
                .collect()
        })
        .unwrap_or_default();

    KafkaRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        headers,
        timestamp: message.timestamp().to_millis(),
    }
}

#[async_trait]
impl KafkaConsumer for RdKafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<KafkaRecord>, KafkaError> {
        match tokio::time::timeout(timeout, self.inner.recv()).await {
            Ok(Ok(message)) => Ok(Some(to_record(&message))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn commit(&mut self, handles: &[CommitHandle]) -> Result<(), KafkaError> {
        if handles.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in next_offsets(handles) {
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset))?;
        }
        self.inner.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    async fn rewind(&mut self, handles: &[CommitHandle]) -> Result<(), KafkaError> {
        for ((topic, partition), offset) in earliest_offsets(handles) {
            self.inner
                .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Classify;
    use crate::SecurityProtocol;

    #[test]
    fn test_classify_codes() {
        assert_eq!(
            classify_code(RDKafkaErrorCode::MessageTimedOut),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::AllBrokersDown),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::SaslAuthenticationFailed),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::UnknownTopicOrPartition),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify_code(RDKafkaErrorCode::MessageSizeTooLarge),
            ErrorClass::Poison
        );
    }

    #[test]
    fn test_production_error_keeps_class() {
        let err: KafkaError =
            RdKafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut).into();
        assert_eq!(err.class(), ErrorClass::Transient);

        let err: KafkaError = RdKafkaError::ClientCreation("bad".to_string()).into();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_producer_config_requires_all_replicas() {
        let config = KafkaConfig {
            security_protocol: SecurityProtocol::SaslSsl,
            sasl_mechanism: Some("PLAIN".to_string()),
            sasl_username: Some("bridge".to_string()),
            sasl_password: Some("secret".to_string()),
            ssl_ca_location: Some("/etc/ssl/ca.pem".to_string()),
            ..KafkaConfig::default()
        };

        let client = producer_config(&config);
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("enable.idempotence"), Some("true"));
        assert_eq!(client.get("message.timeout.ms"), Some("30000"));
        assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let client = consumer_config(&KafkaConfig::default(), "mqbridge");
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("group.id"), Some("mqbridge"));
        assert_eq!(client.get("sasl.username"), None);
    }
}
