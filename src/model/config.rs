//! Bridge configuration.
//!
//! The file format is a flat JSON object with dotted keys, the same shape as
//! a Kafka Connect connector config. Numbers may be written as JSON numbers
//! or as strings. Everything is validated once here and handed to adapters
//! and engines as typed structs.

use mqbridge_client::mq::parse_connection_list;
use mqbridge_client::{KafkaConfig, MqConfig, MqTransport, SecurityProtocol};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("'{s}' is not a number: {e}"))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
    }

    match Option::<BoolOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(BoolOrString::Bool(b)) => Ok(Some(b)),
        Some(BoolOrString::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(serde::de::Error::custom(format!("'{s}' is not a boolean"))),
        },
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(rename = "mq.transport")]
    mq_transport: Option<String>,
    #[serde(rename = "mq.queue.manager")]
    mq_queue_manager: Option<String>,
    #[serde(rename = "mq.channel")]
    mq_channel: Option<String>,
    #[serde(rename = "mq.connection.name.list")]
    mq_connection_name_list: Option<String>,
    #[serde(rename = "mq.queue")]
    mq_queue: Option<String>,
    #[serde(rename = "mq.sink.queue")]
    mq_sink_queue: Option<String>,
    #[serde(rename = "mq.user.name")]
    mq_user_name: Option<String>,
    #[serde(rename = "mq.password")]
    mq_password: Option<String>,
    #[serde(rename = "mq.ssl.cipher.spec")]
    mq_ssl_cipher_spec: Option<String>,
    #[serde(rename = "mq.max.message.bytes", default, deserialize_with = "lenient_u64")]
    mq_max_message_bytes: Option<u64>,

    #[serde(rename = "kafka.bootstrap.servers")]
    kafka_bootstrap_servers: Option<String>,
    #[serde(rename = "kafka.client.id")]
    kafka_client_id: Option<String>,
    #[serde(rename = "kafka.source.topic")]
    kafka_source_topic: Option<String>,
    #[serde(rename = "kafka.sink.topic")]
    kafka_sink_topic: Option<String>,
    #[serde(rename = "kafka.group.id")]
    kafka_group_id: Option<String>,
    #[serde(rename = "kafka.security.protocol")]
    kafka_security_protocol: Option<String>,
    #[serde(rename = "kafka.sasl.mechanism")]
    kafka_sasl_mechanism: Option<String>,
    #[serde(rename = "kafka.sasl.username")]
    kafka_sasl_username: Option<String>,
    #[serde(rename = "kafka.sasl.password")]
    kafka_sasl_password: Option<String>,
    #[serde(rename = "kafka.produce.timeout.ms", default, deserialize_with = "lenient_u64")]
    kafka_produce_timeout_ms: Option<u64>,
    #[serde(rename = "kafka.max.message.bytes", default, deserialize_with = "lenient_u64")]
    kafka_max_message_bytes: Option<u64>,

    #[serde(rename = "batch.size", default, deserialize_with = "lenient_u64")]
    batch_size: Option<u64>,
    #[serde(rename = "batch.timeout.ms", default, deserialize_with = "lenient_u64")]
    batch_timeout_ms: Option<u64>,
    #[serde(rename = "poll.timeout.ms", default, deserialize_with = "lenient_u64")]
    poll_timeout_ms: Option<u64>,
    #[serde(rename = "max.retries", default, deserialize_with = "lenient_u64")]
    max_retries: Option<u64>,
    #[serde(rename = "backoff.initial.ms", default, deserialize_with = "lenient_u64")]
    backoff_initial_ms: Option<u64>,
    #[serde(rename = "backoff.max.ms", default, deserialize_with = "lenient_u64")]
    backoff_max_ms: Option<u64>,
    #[serde(rename = "tls.truststore.path")]
    tls_truststore_path: Option<String>,
    #[serde(rename = "tls.truststore.password")]
    tls_truststore_password: Option<String>,
    #[serde(rename = "key.source.header")]
    key_source_header: Option<String>,
    #[serde(rename = "header.value.max.bytes", default, deserialize_with = "lenient_u64")]
    header_value_max_bytes: Option<u64>,

    #[serde(rename = "dead.letter.queue")]
    dead_letter_queue: Option<String>,
    #[serde(rename = "dead.letter.topic")]
    dead_letter_topic: Option<String>,

    #[serde(rename = "source.enabled", default, deserialize_with = "lenient_bool")]
    source_enabled: Option<bool>,
    #[serde(rename = "sink.enabled", default, deserialize_with = "lenient_bool")]
    sink_enabled: Option<bool>,
    #[serde(rename = "source.tasks", default, deserialize_with = "lenient_u64")]
    source_tasks: Option<u64>,
    #[serde(rename = "sink.tasks", default, deserialize_with = "lenient_u64")]
    sink_tasks: Option<u64>,

    #[serde(rename = "health.bind")]
    health_bind: Option<String>,
    #[serde(rename = "headers.static", default)]
    headers_static: BTreeMap<String, String>,
    #[serde(rename = "payload.schema.path")]
    payload_schema_path: Option<String>,
}

/// MQ -> Kafka direction.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub enabled: bool,
    pub tasks: usize,
    pub queue: String,
    pub topic: String,
}

/// Kafka -> MQ direction.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub enabled: bool,
    pub tasks: usize,
    pub topic: String,
    pub group_id: String,
    pub queue: String,
}

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// MQ property whose value becomes the Kafka key. Correlation ID when unset.
    pub key_source_header: Option<String>,
    pub header_value_max_bytes: usize,
    pub kafka_max_message_bytes: usize,
    pub mq_max_message_bytes: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            key_source_header: None,
            header_value_max_bytes: 8192,
            kafka_max_message_bytes: 1024 * 1024,
            mq_max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Redeliveries a poison message gets before it is dead-lettered.
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub queue: String,
    /// When set, dead letters go to this Kafka topic instead of `queue`.
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StageConfig {
    pub static_headers: Vec<(String, String)>,
    pub payload_schema_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mq: MqConfig,
    pub kafka: KafkaConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub translator: TranslatorConfig,
    pub batch: BatchConfig,
    pub poll_timeout: Duration,
    pub retry: RetryConfig,
    pub dead_letter: DeadLetterConfig,
    pub stages: StageConfig,
    pub health: HealthConfig,
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let transport = match raw.mq_transport.as_deref() {
            Some(t) => t.parse().map_err(|e: String| invalid("mq.transport", e))?,
            None => MqTransport::Client,
        };
        let connection_names = parse_connection_list(
            raw.mq_connection_name_list
                .as_deref()
                .unwrap_or("localhost(1414)"),
        )
        .map_err(|e| invalid("mq.connection.name.list", e))?;
        if transport == MqTransport::Client && connection_names.is_empty() {
            return Err(invalid(
                "mq.connection.name.list",
                "at least one host(port) is required for the client transport",
            ));
        }

        let translator = TranslatorConfig {
            key_source_header: raw.key_source_header,
            header_value_max_bytes: raw.header_value_max_bytes.unwrap_or(8192) as usize,
            kafka_max_message_bytes: raw.kafka_max_message_bytes.unwrap_or(1024 * 1024) as usize,
            mq_max_message_bytes: raw.mq_max_message_bytes.unwrap_or(4 * 1024 * 1024) as usize,
        };
        if translator.header_value_max_bytes == 0 {
            return Err(invalid("header.value.max.bytes", "must be greater than 0"));
        }
        if matches!(translator.key_source_header.as_deref(), Some(h) if h.trim().is_empty()) {
            return Err(invalid("key.source.header", "must not be empty"));
        }

        let mq = MqConfig {
            transport,
            queue_manager: raw.mq_queue_manager.unwrap_or_else(|| "QM1".to_string()),
            channel: raw
                .mq_channel
                .unwrap_or_else(|| "DEV.APP.SVRCONN".to_string()),
            connection_names,
            user: raw.mq_user_name,
            password: raw.mq_password,
            ssl_cipher_spec: raw.mq_ssl_cipher_spec,
            key_repository: raw.tls_truststore_path.clone(),
            key_repository_password: raw.tls_truststore_password,
            max_message_bytes: translator.mq_max_message_bytes,
        };
        if mq.queue_manager.is_empty() {
            return Err(invalid("mq.queue.manager", "must not be empty"));
        }

        let security_protocol: SecurityProtocol = match raw.kafka_security_protocol.as_deref() {
            Some(p) => p
                .parse()
                .map_err(|e: String| invalid("kafka.security.protocol", e))?,
            None => SecurityProtocol::Plaintext,
        };
        if security_protocol.uses_sasl()
            && (raw.kafka_sasl_username.is_none() || raw.kafka_sasl_password.is_none())
        {
            return Err(invalid(
                "kafka.sasl.username",
                format!(
                    "username and password are required with {}",
                    security_protocol.as_str()
                ),
            ));
        }
        let kafka = KafkaConfig {
            bootstrap_servers: raw
                .kafka_bootstrap_servers
                .unwrap_or_else(|| "localhost:9092".to_string()),
            client_id: raw.kafka_client_id.unwrap_or_else(|| "mqbridge".to_string()),
            security_protocol,
            sasl_mechanism: raw.kafka_sasl_mechanism,
            sasl_username: raw.kafka_sasl_username,
            sasl_password: raw.kafka_sasl_password,
            ssl_ca_location: raw.tls_truststore_path,
            produce_timeout: Duration::from_millis(raw.kafka_produce_timeout_ms.unwrap_or(30_000)),
            max_message_bytes: translator.kafka_max_message_bytes,
            ..KafkaConfig::default()
        };

        let source = SourceConfig {
            enabled: raw.source_enabled.unwrap_or(true),
            tasks: raw.source_tasks.unwrap_or(1) as usize,
            queue: raw.mq_queue.unwrap_or_else(|| "KAFKA.IN".to_string()),
            topic: raw
                .kafka_source_topic
                .unwrap_or_else(|| "mq-messages-in".to_string()),
        };
        let sink = SinkConfig {
            enabled: raw.sink_enabled.unwrap_or(true),
            tasks: raw.sink_tasks.unwrap_or(1) as usize,
            topic: raw
                .kafka_sink_topic
                .unwrap_or_else(|| "mq-messages-out".to_string()),
            group_id: raw.kafka_group_id.unwrap_or_else(|| "mqbridge".to_string()),
            queue: raw.mq_sink_queue.unwrap_or_else(|| "KAFKA.OUT".to_string()),
        };
        if !source.enabled && !sink.enabled {
            return Err(invalid("source.enabled", "at least one direction must be enabled"));
        }
        if source.enabled && source.tasks == 0 {
            return Err(invalid("source.tasks", "must be at least 1"));
        }
        if sink.enabled && sink.tasks == 0 {
            return Err(invalid("sink.tasks", "must be at least 1"));
        }
        for (key, value) in [
            ("mq.queue", &source.queue),
            ("kafka.source.topic", &source.topic),
            ("mq.sink.queue", &sink.queue),
            ("kafka.sink.topic", &sink.topic),
            ("kafka.group.id", &sink.group_id),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }

        let batch = BatchConfig {
            size: raw.batch_size.unwrap_or(1) as usize,
            timeout: Duration::from_millis(raw.batch_timeout_ms.unwrap_or(100)),
        };
        if batch.size == 0 {
            return Err(invalid("batch.size", "must be at least 1"));
        }

        let retry = RetryConfig {
            max_retries: u32::try_from(raw.max_retries.unwrap_or(3))
                .map_err(|_| invalid("max.retries", "too large"))?,
            backoff_initial: Duration::from_millis(raw.backoff_initial_ms.unwrap_or(1_000)),
            backoff_max: Duration::from_millis(raw.backoff_max_ms.unwrap_or(60_000)),
        };
        if retry.backoff_initial.is_zero() {
            return Err(invalid("backoff.initial.ms", "must be greater than 0"));
        }
        if retry.backoff_initial > retry.backoff_max {
            return Err(invalid(
                "backoff.max.ms",
                "must not be smaller than backoff.initial.ms",
            ));
        }

        let dead_letter = DeadLetterConfig {
            queue: raw
                .dead_letter_queue
                .unwrap_or_else(|| "SYSTEM.DEAD.LETTER.QUEUE".to_string()),
            topic: raw.dead_letter_topic.filter(|t| !t.trim().is_empty()),
        };

        let health_bind = raw.health_bind.as_deref().unwrap_or("0.0.0.0:8080");
        let health = HealthConfig {
            bind: health_bind
                .parse()
                .map_err(|e| invalid("health.bind", format!("{health_bind}: {e}")))?,
        };

        Ok(Self {
            mq,
            kafka,
            source,
            sink,
            translator,
            batch,
            poll_timeout: Duration::from_millis(raw.poll_timeout_ms.unwrap_or(1_000)),
            retry,
            dead_letter,
            stages: StageConfig {
                static_headers: raw.headers_static.into_iter().collect(),
                payload_schema_path: raw.payload_schema_path.map(PathBuf::from),
            },
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_json_str("{}").unwrap();

        assert_eq!(config.mq.queue_manager, "QM1");
        assert_eq!(config.mq.channel, "DEV.APP.SVRCONN");
        assert_eq!(config.mq.transport, MqTransport::Client);
        assert_eq!(config.source.queue, "KAFKA.IN");
        assert_eq!(config.source.topic, "mq-messages-in");
        assert_eq!(config.batch.size, 1);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.backoff_initial, Duration::from_secs(1));
        assert_eq!(config.retry.backoff_max, Duration::from_secs(60));
        assert_eq!(config.kafka.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.dead_letter.topic.is_none());
    }

    #[test]
    fn test_connector_style_config() {
        let config = BridgeConfig::from_json_str(
            r#"{
                "mq.transport": "memory",
                "mq.queue.manager": "QM1",
                "mq.connection.name.list": "ibm-mq.mq-kafka-integration.svc.cluster.local(1414)",
                "mq.queue": "KAFKA.IN",
                "mq.user.name": "app",
                "mq.password": "passw0rd",
                "kafka.bootstrap.servers": "kafka-0:9071,kafka-1:9071",
                "kafka.security.protocol": "SASL_SSL",
                "kafka.sasl.mechanism": "PLAIN",
                "kafka.sasl.username": "bridge",
                "kafka.sasl.password": "secret",
                "batch.size": "50",
                "batch.timeout.ms": 250,
                "source.enabled": "true",
                "sink.tasks": 2,
                "tls.truststore.path": "/etc/bridge/ca.pem",
                "key.source.header": "customer_id",
                "dead.letter.topic": "mq-bridge-dlt",
                "headers.static": {"bridge": "mqbridge"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.mq.transport, MqTransport::Memory);
        assert_eq!(config.mq.connection_names[0].port, 1414);
        assert_eq!(config.mq.user.as_deref(), Some("app"));
        assert_eq!(config.kafka.security_protocol, SecurityProtocol::SaslSsl);
        assert_eq!(config.kafka.ssl_ca_location.as_deref(), Some("/etc/bridge/ca.pem"));
        assert_eq!(config.mq.key_repository.as_deref(), Some("/etc/bridge/ca.pem"));
        assert_eq!(config.batch.size, 50);
        assert_eq!(config.batch.timeout, Duration::from_millis(250));
        assert_eq!(config.sink.tasks, 2);
        assert_eq!(
            config.translator.key_source_header.as_deref(),
            Some("customer_id")
        );
        assert_eq!(config.dead_letter.topic.as_deref(), Some("mq-bridge-dlt"));
        assert_eq!(
            config.stages.static_headers,
            vec![("bridge".to_string(), "mqbridge".to_string())]
        );
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = BridgeConfig::from_json_str(r#"{"batch.sise": 10}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            (r#"{"batch.size": 0}"#, "batch.size"),
            (r#"{"backoff.initial.ms": 5000, "backoff.max.ms": 1000}"#, "backoff.max.ms"),
            (r#"{"kafka.security.protocol": "SASL_SSL"}"#, "kafka.sasl.username"),
            (r#"{"mq.transport": "bindings"}"#, "mq.transport"),
            (r#"{"mq.connection.name.list": "localhost:1414"}"#, "mq.connection.name.list"),
            (r#"{"source.enabled": false, "sink.enabled": false}"#, "source.enabled"),
            (r#"{"health.bind": "nowhere"}"#, "health.bind"),
        ];

        for (json, expected_key) in cases {
            match BridgeConfig::from_json_str(json) {
                Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, expected_key, "{json}"),
                other => panic!("expected invalid {expected_key} for {json}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_rejects_non_numeric_strings() {
        let err = BridgeConfig::from_json_str(r#"{"batch.size": "many"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mq.queue": "ORDERS.IN", "poll.timeout.ms": 200}}"#).unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source.queue, "ORDERS.IN");
        assert_eq!(config.poll_timeout, Duration::from_millis(200));

        let err = BridgeConfig::from_file("/nonexistent/bridge.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
