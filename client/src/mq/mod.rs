//! IBM MQ side of the bridge.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
#[cfg(not(feature = "mqi"))]
use tracing::info;

use crate::{Classify, ErrorClass, Header};

pub mod memory;
#[cfg(feature = "mqi")]
mod client;

pub use memory::InMemoryQueueManager;
#[cfg(feature = "mqi")]
pub use client::ClientTransportConnector;

/// Fixed size of an MQMD correlation identifier.
pub const CORREL_ID_LENGTH: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Queue manager quiescing: {0}")]
    Quiescing(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Unknown object: {0}")]
    UnknownObject(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Message too large: {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// The queue manager refused this particular message.
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("MQI call failed: {0}")]
    Failed(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl Classify for MqError {
    fn class(&self) -> ErrorClass {
        match self {
            MqError::Connection(_)
            | MqError::ConnectionLost(_)
            | MqError::Quiescing(_)
            | MqError::QueueFull(_) => ErrorClass::Transient,
            MqError::MessageTooLarge { .. } | MqError::Rejected(_) => ErrorClass::Poison,
            MqError::NotAuthorized(_)
            | MqError::UnknownObject(_)
            | MqError::Failed(_)
            | MqError::TransportUnavailable(_) => ErrorClass::Fatal,
        }
    }
}

/// MQRC reason codes the bridge tells apart.
pub mod reason {
    pub const CONNECTION_BROKEN: i32 = 2009;
    pub const DATA_LENGTH_ERROR: i32 = 2010;
    pub const MSG_TOO_BIG_FOR_Q: i32 = 2030;
    pub const MSG_TOO_BIG_FOR_Q_MGR: i32 = 2031;
    pub const NO_MSG_AVAILABLE: i32 = 2033;
    pub const NOT_AUTHORIZED: i32 = 2035;
    pub const Q_FULL: i32 = 2053;
    pub const Q_MGR_NAME_ERROR: i32 = 2058;
    pub const Q_MGR_NOT_AVAILABLE: i32 = 2059;
    pub const SECURITY_ERROR: i32 = 2063;
    pub const TRUNCATED_MSG_FAILED: i32 = 2080;
    pub const UNKNOWN_OBJECT_NAME: i32 = 2085;
    pub const Q_MGR_QUIESCING: i32 = 2161;
    pub const Q_MGR_STOPPING: i32 = 2162;
    pub const CONNECTION_QUIESCING: i32 = 2202;
    pub const CONNECTION_STOPPING: i32 = 2203;
    pub const SSL_INITIALIZATION_ERROR: i32 = 2393;
    pub const PROPERTY_NAME_ERROR: i32 = 2442;
    pub const PROPERTY_VALUE_TOO_BIG: i32 = 2469;
    pub const PROPERTY_NOT_AVAILABLE: i32 = 2471;
    pub const CHANNEL_NOT_AVAILABLE: i32 = 2537;
    pub const HOST_NOT_AVAILABLE: i32 = 2538;
    pub const UNKNOWN_CHANNEL_NAME: i32 = 2540;
}

impl MqError {
    /// Maps a failed MQI call's reason code. `object` names the queue or queue
    /// manager the call was made against.
    pub fn from_reason(code: i32, object: &str) -> MqError {
        let detail = format!("{object} (MQRC {code})");
        match code {
            reason::CONNECTION_BROKEN => MqError::ConnectionLost(detail),
            reason::Q_MGR_NOT_AVAILABLE
            | reason::CHANNEL_NOT_AVAILABLE
            | reason::HOST_NOT_AVAILABLE => MqError::Connection(detail),
            reason::Q_MGR_QUIESCING
            | reason::Q_MGR_STOPPING
            | reason::CONNECTION_QUIESCING
            | reason::CONNECTION_STOPPING => MqError::Quiescing(detail),
            reason::NOT_AUTHORIZED | reason::SECURITY_ERROR | reason::SSL_INITIALIZATION_ERROR => {
                MqError::NotAuthorized(detail)
            }
            reason::UNKNOWN_OBJECT_NAME
            | reason::Q_MGR_NAME_ERROR
            | reason::UNKNOWN_CHANNEL_NAME => MqError::UnknownObject(detail),
            reason::Q_FULL => MqError::QueueFull(detail),
            reason::DATA_LENGTH_ERROR
            | reason::MSG_TOO_BIG_FOR_Q
            | reason::MSG_TOO_BIG_FOR_Q_MGR
            | reason::PROPERTY_NAME_ERROR
            | reason::PROPERTY_VALUE_TOO_BIG => MqError::Rejected(detail),
            _ => MqError::Failed(detail),
        }
    }
}

/// A message as read from, or written to, a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqMessage {
    /// Assigned by the queue manager on put; ignored on outbound messages.
    pub message_id: Bytes,
    pub correlation_id: Option<Bytes>,
    pub properties: Vec<Header>,
    pub payload: Bytes,
    /// Number of times this message was backed out. Maintained by the queue manager.
    pub backout_count: u32,
    pub put_time: Option<DateTime<Utc>>,
}

impl MqMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: Bytes::new(),
            correlation_id: None,
            properties: Vec::new(),
            payload: payload.into(),
            backout_count: 0,
            put_time: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<Bytes>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.properties.push(Header::new(name, value));
        self
    }

    /// Wire size used for MAXMSGL style checks.
    pub fn size(&self) -> usize {
        self.payload.len()
            + self
                .properties
                .iter()
                .map(|p| p.name.len() + p.value.len())
                .sum::<usize>()
    }
}

/// Result of a bounded wait on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Message(MqMessage),
    /// Nothing arrived before the wait interval expired.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqTransport {
    /// MQI client connection over a server-connection channel.
    Client,
    /// In-process queue manager.
    Memory,
}

impl FromStr for MqTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(MqTransport::Client),
            "memory" => Ok(MqTransport::Memory),
            other => Err(format!("unknown MQ transport '{other}'")),
        }
    }
}

/// One entry of an MQ connection name list, written `host(port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionName {
    pub host: String,
    pub port: u16,
}

impl FromStr for ConnectionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let open = s
            .find('(')
            .ok_or_else(|| format!("connection name '{s}' is not host(port)"))?;
        let port = s[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| format!("connection name '{s}' is missing ')'"))?;
        let host = &s[..open];
        if host.is_empty() {
            return Err(format!("connection name '{s}' has an empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("connection name '{s}' has an invalid port: {e}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.host, self.port)
    }
}

/// Parses a comma separated connection name list such as `mq1(1414),mq2(1414)`.
pub fn parse_connection_list(list: &str) -> Result<Vec<ConnectionName>, String> {
    list.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(str::parse)
        .collect()
}

#[derive(Debug, Clone)]
pub struct MqConfig {
    pub transport: MqTransport,
    pub queue_manager: String,
    pub channel: String,
    pub connection_names: Vec<ConnectionName>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_cipher_spec: Option<String>,
    /// Key repository holding the trusted CA certificates.
    pub key_repository: Option<String>,
    pub key_repository_password: Option<String>,
    pub max_message_bytes: usize,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            transport: MqTransport::Client,
            queue_manager: "QM1".to_string(),
            channel: "DEV.APP.SVRCONN".to_string(),
            connection_names: vec![ConnectionName {
                host: "localhost".to_string(),
                port: 1414,
            }],
            user: None,
            password: None,
            ssl_cipher_spec: None,
            key_repository: None,
            key_repository_password: None,
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

/// A connection to a queue manager with a single open unit of work.
///
/// Every get and put happens under syncpoint. Nothing becomes visible to other
/// sessions until [`MqSession::commit`]; [`MqSession::backout`] returns gotten
/// messages to their queues and discards pending puts. Dropping a session
/// with an open unit of work backs it out.
#[async_trait]
pub trait MqSession: Send + Sync {
    /// Waits up to `wait` for the next message on `queue`.
    async fn get_next(&mut self, queue: &str, wait: Duration) -> Result<GetOutcome, MqError>;

    async fn put(&mut self, queue: &str, message: MqMessage) -> Result<(), MqError>;

    async fn commit(&mut self) -> Result<(), MqError>;

    async fn backout(&mut self) -> Result<(), MqError>;

    /// True while gets or puts are pending in the current unit of work.
    fn in_transaction(&self) -> bool;
}

#[async_trait]
pub trait MqConnector: Send + Sync {
    async fn connect(&self, config: &MqConfig) -> Result<Box<dyn MqSession>, MqError>;
}

/// Connector for `mq.transport = client` in builds without the `mqi` feature.
///
/// Validates the channel definition and then refuses to connect.
#[cfg(not(feature = "mqi"))]
pub struct ClientTransportConnector;

#[cfg(not(feature = "mqi"))]
#[async_trait]
impl MqConnector for ClientTransportConnector {
    async fn connect(&self, config: &MqConfig) -> Result<Box<dyn MqSession>, MqError> {
        if config.connection_names.is_empty() {
            return Err(MqError::Connection(
                "connection name list is empty".to_string(),
            ));
        }
        let targets: Vec<String> = config
            .connection_names
            .iter()
            .map(ToString::to_string)
            .collect();
        info!(
            "Connecting to queue manager {} via channel {} at {:?}",
            config.queue_manager, config.channel, targets
        );

        Err(MqError::TransportUnavailable(format!(
            "client transport to {} needs a build with the `mqi` feature",
            config.queue_manager
        )))
    }
}
