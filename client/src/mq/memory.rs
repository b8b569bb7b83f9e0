//! In-process queue manager with MQ syncpoint semantics.
//!
//! Gets and puts made by a session stay invisible to other sessions until the
//! session commits. A backout returns gotten messages to the head of their
//! queue with the backout count bumped, which is what drives poison-message
//! handling in the engines.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{GetOutcome, MqConfig, MqConnector, MqError, MqMessage, MqSession, CORREL_ID_LENGTH};

const DEFAULT_MAX_DEPTH: usize = 5000;

struct LocalQueue {
    max_depth: usize,
    messages: VecDeque<MqMessage>,
    uncommitted_puts: usize,
}

impl LocalQueue {
    fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            messages: VecDeque::new(),
            uncommitted_puts: 0,
        }
    }
}

pub struct InMemoryQueueManager {
    name: String,
    queues: Mutex<HashMap<String, LocalQueue>>,
    notify: Notify,
    available: AtomicBool,
    // Bumped on every outage so sessions opened before it see the connection as broken.
    epoch: AtomicU64,
    credentials: Option<(String, String)>,
    max_message_bytes: usize,
    next_message: AtomicU64,
}

impl InMemoryQueueManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            credentials: None,
            max_message_bytes: 4 * 1024 * 1024,
            next_message: AtomicU64::new(1),
        }
    }

    /// Requires every connection to authenticate with these credentials.
    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn define_queue(&self, name: &str) {
        self.define_queue_with_depth(name, DEFAULT_MAX_DEPTH);
    }

    pub fn define_queue_with_depth(&self, name: &str, max_depth: usize) {
        self.queues()
            .entry(name.to_string())
            .or_insert_with(|| LocalQueue::new(max_depth));
    }

    /// Simulates the queue manager going away (`false`) and coming back (`true`).
    ///
    /// Sessions opened before an outage stay broken after it ends.
    pub fn set_available(&self, available: bool) {
        if !available {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.available.store(available, Ordering::SeqCst);
        info!(
            "Queue manager {} is now {}",
            self.name,
            if available { "available" } else { "unavailable" }
        );
        self.notify.notify_waiters();
    }

    /// Committed depth of a queue.
    pub fn depth(&self, queue: &str) -> usize {
        self.queues()
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Copies of the committed messages on a queue, head first.
    pub fn browse(&self, queue: &str) -> Vec<MqMessage> {
        self.queues()
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Puts and commits a single message outside of any session.
    pub fn put_committed(&self, queue: &str, message: MqMessage) -> Result<Bytes, MqError> {
        let message = self.stamp(message)?;
        let id = message.message_id.clone();
        {
            let mut queues = self.queues();
            let local = queues
                .get_mut(queue)
                .ok_or_else(|| MqError::UnknownObject(queue.to_string()))?;
            if local.messages.len() + local.uncommitted_puts >= local.max_depth {
                return Err(MqError::QueueFull(queue.to_string()));
            }
            local.messages.push_back(message);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, LocalQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn stamp(&self, mut message: MqMessage) -> Result<MqMessage, MqError> {
        if message.size() > self.max_message_bytes {
            return Err(MqError::MessageTooLarge {
                size: message.size(),
                max: self.max_message_bytes,
            });
        }
        if let Some(correl) = &message.correlation_id {
            if correl.len() > CORREL_ID_LENGTH {
                return Err(MqError::MessageTooLarge {
                    size: correl.len(),
                    max: CORREL_ID_LENGTH,
                });
            }
        }
        message.message_id = self.next_message_id();
        message.backout_count = 0;
        message.put_time = Some(Utc::now());
        Ok(message)
    }

    fn next_message_id(&self) -> Bytes {
        let seq = self.next_message.fetch_add(1, Ordering::SeqCst);
        let mut id = BytesMut::with_capacity(CORREL_ID_LENGTH);
        id.put_slice(Uuid::new_v4().as_bytes());
        id.put_u64(seq);
        id.freeze()
    }
}

#[async_trait]
impl MqConnector for Arc<InMemoryQueueManager> {
    async fn connect(&self, config: &MqConfig) -> Result<Box<dyn MqSession>, MqError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(MqError::Connection(format!(
                "queue manager {} is not reachable",
                self.name
            )));
        }
        if config.queue_manager != self.name {
            return Err(MqError::UnknownObject(format!(
                "queue manager {}",
                config.queue_manager
            )));
        }
        if let Some((user, password)) = &self.credentials {
            let supplied = (config.user.as_deref(), config.password.as_deref());
            if supplied != (Some(user.as_str()), Some(password.as_str())) {
                return Err(MqError::NotAuthorized(format!(
                    "user {:?} on queue manager {}",
                    config.user, self.name
                )));
            }
        }

        debug!("Opened session on queue manager {}", self.name);
        Ok(Box::new(InMemorySession {
            qm: Arc::clone(self),
            epoch: self.current_epoch(),
            gets: Vec::new(),
            puts: Vec::new(),
        }))
    }
}

pub struct InMemorySession {
    qm: Arc<InMemoryQueueManager>,
    epoch: u64,
    gets: Vec<(String, MqMessage)>,
    puts: Vec<(String, MqMessage)>,
}

impl InMemorySession {
    fn check_connection(&mut self) -> Result<(), MqError> {
        if self.qm.available.load(Ordering::SeqCst) && self.qm.current_epoch() == self.epoch {
            return Ok(());
        }
        // The queue manager rolls back whatever the broken connection had in flight.
        self.rollback();
        Err(MqError::ConnectionLost(format!(
            "connection to queue manager {} was broken",
            self.qm.name
        )))
    }

    fn rollback(&mut self) {
        if self.gets.is_empty() && self.puts.is_empty() {
            return;
        }
        {
            let mut queues = self.qm.queues();
            // Reverse order keeps the original head-of-queue ordering.
            for (queue, mut message) in self.gets.drain(..).rev() {
                if let Some(local) = queues.get_mut(&queue) {
                    message.backout_count += 1;
                    local.messages.push_front(message);
                }
            }
            for (queue, _) in self.puts.drain(..) {
                if let Some(local) = queues.get_mut(&queue) {
                    local.uncommitted_puts = local.uncommitted_puts.saturating_sub(1);
                }
            }
        }
        self.qm.notify.notify_waiters();
    }
}

#[async_trait]
impl MqSession for InMemorySession {
    async fn get_next(&mut self, queue: &str, wait: Duration) -> Result<GetOutcome, MqError> {
        let deadline = Instant::now() + wait;
        let qm = Arc::clone(&self.qm);

        loop {
            let notified = qm.notify.notified();
            self.check_connection()?;
            {
                let mut queues = qm.queues();
                let local = queues
                    .get_mut(queue)
                    .ok_or_else(|| MqError::UnknownObject(queue.to_string()))?;
                if let Some(message) = local.messages.pop_front() {
                    self.gets.push((queue.to_string(), message.clone()));
                    return Ok(GetOutcome::Message(message));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(GetOutcome::Empty);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn put(&mut self, queue: &str, message: MqMessage) -> Result<(), MqError> {
        self.check_connection()?;
        let message = self.qm.stamp(message)?;

        let mut queues = self.qm.queues();
        let local = queues
            .get_mut(queue)
            .ok_or_else(|| MqError::UnknownObject(queue.to_string()))?;
        if local.messages.len() + local.uncommitted_puts >= local.max_depth {
            return Err(MqError::QueueFull(queue.to_string()));
        }
        local.uncommitted_puts += 1;
        self.puts.push((queue.to_string(), message));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MqError> {
        self.check_connection()?;
        {
            let mut queues = self.qm.queues();
            for (queue, message) in self.puts.drain(..) {
                if let Some(local) = queues.get_mut(&queue) {
                    local.uncommitted_puts = local.uncommitted_puts.saturating_sub(1);
                    local.messages.push_back(message);
                }
            }
        }
        self.gets.clear();
        self.qm.notify.notify_waiters();
        Ok(())
    }

    async fn backout(&mut self) -> Result<(), MqError> {
        self.rollback();
        self.check_connection()
    }

    fn in_transaction(&self) -> bool {
        !self.gets.is_empty() || !self.puts.is_empty()
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Classify, ErrorClass};

    fn config() -> MqConfig {
        MqConfig {
            queue_manager: "QM1".to_string(),
            ..MqConfig::default()
        }
    }

    fn qm() -> Arc<InMemoryQueueManager> {
        let qm = Arc::new(InMemoryQueueManager::new("QM1"));
        qm.define_queue("KAFKA.IN");
        qm
    }

    async fn next(session: &mut Box<dyn MqSession>, queue: &str) -> Option<MqMessage> {
        match session
            .get_next(queue, Duration::from_millis(10))
            .await
            .unwrap()
        {
            GetOutcome::Message(message) => Some(message),
            GetOutcome::Empty => None,
        }
    }

    #[tokio::test]
    async fn test_get_is_invisible_until_commit() {
        let qm = qm();
        qm.put_committed("KAFKA.IN", MqMessage::new("hello")).unwrap();

        let mut session = qm.connect(&config()).await.unwrap();
        let message = next(&mut session, "KAFKA.IN").await.unwrap();
        assert_eq!(message.payload, Bytes::from("hello"));
        assert_eq!(message.message_id.len(), CORREL_ID_LENGTH);
        assert!(session.in_transaction());
        assert_eq!(qm.depth("KAFKA.IN"), 0);

        session.commit().await.unwrap();
        assert!(!session.in_transaction());
        assert_eq!(qm.depth("KAFKA.IN"), 0);
    }

    #[tokio::test]
    async fn test_backout_requeues_at_head_with_count() {
        let qm = qm();
        qm.put_committed("KAFKA.IN", MqMessage::new("first")).unwrap();
        qm.put_committed("KAFKA.IN", MqMessage::new("second")).unwrap();

        let mut session = qm.connect(&config()).await.unwrap();
        next(&mut session, "KAFKA.IN").await.unwrap();
        next(&mut session, "KAFKA.IN").await.unwrap();
        session.backout().await.unwrap();

        let browsed = qm.browse("KAFKA.IN");
        assert_eq!(browsed.len(), 2);
        assert_eq!(browsed[0].payload, Bytes::from("first"));
        assert_eq!(browsed[0].backout_count, 1);
        assert_eq!(browsed[1].payload, Bytes::from("second"));
    }

    #[tokio::test]
    async fn test_dropped_session_backs_out() {
        let qm = qm();
        qm.put_committed("KAFKA.IN", MqMessage::new("hello")).unwrap();

        {
            let mut session = qm.connect(&config()).await.unwrap();
            next(&mut session, "KAFKA.IN").await.unwrap();
        }

        assert_eq!(qm.depth("KAFKA.IN"), 1);
        assert_eq!(qm.browse("KAFKA.IN")[0].backout_count, 1);
    }

    #[tokio::test]
    async fn test_uncommitted_put_is_invisible() {
        let qm = qm();
        qm.define_queue("KAFKA.OUT");
        let mut writer = qm.connect(&config()).await.unwrap();
        let mut reader = qm.connect(&config()).await.unwrap();

        writer
            .put("KAFKA.OUT", MqMessage::new("out").with_correlation_id("abc"))
            .await
            .unwrap();
        assert!(next(&mut reader, "KAFKA.OUT").await.is_none());

        writer.commit().await.unwrap();
        let message = next(&mut reader, "KAFKA.OUT").await.unwrap();
        assert_eq!(message.correlation_id, Some(Bytes::from("abc")));
    }

    #[tokio::test]
    async fn test_get_waits_for_late_message() {
        let qm = qm();
        let mut session = qm.connect(&config()).await.unwrap();

        let producer = Arc::clone(&qm);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer
                .put_committed("KAFKA.IN", MqMessage::new("late"))
                .unwrap();
        });

        let outcome = session
            .get_next("KAFKA.IN", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(outcome, GetOutcome::Message(m) if m.payload == Bytes::from("late")));
    }

    #[tokio::test]
    async fn test_queue_full_and_unknown_queue() {
        let qm = qm();
        qm.define_queue_with_depth("SMALL", 1);
        let mut session = qm.connect(&config()).await.unwrap();

        session.put("SMALL", MqMessage::new("a")).await.unwrap();
        let err = session.put("SMALL", MqMessage::new("b")).await.unwrap_err();
        assert_eq!(err, MqError::QueueFull("SMALL".to_string()));
        assert_eq!(err.class(), ErrorClass::Transient);

        let err = session.put("MISSING", MqMessage::new("c")).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_outage_breaks_existing_sessions() {
        let qm = qm();
        qm.put_committed("KAFKA.IN", MqMessage::new("hello")).unwrap();
        let mut session = qm.connect(&config()).await.unwrap();
        next(&mut session, "KAFKA.IN").await.unwrap();

        qm.set_available(false);
        let err = session.commit().await.unwrap_err();
        assert!(matches!(err, MqError::ConnectionLost(_)));
        assert_eq!(qm.depth("KAFKA.IN"), 1);

        qm.set_available(true);
        assert!(session.commit().await.is_err());
        assert!(qm.connect(&config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_checks_credentials_and_name() {
        let qm = Arc::new(InMemoryQueueManager::new("QM1").with_credentials("app", "passw0rd"));

        let err = match qm.connect(&config()).await {
            Ok(_) => panic!("connected without credentials"),
            Err(e) => e,
        };
        assert_eq!(err.class(), ErrorClass::Fatal);

        let good = MqConfig {
            user: Some("app".to_string()),
            password: Some("passw0rd".to_string()),
            ..config()
        };
        assert!(qm.connect(&good).await.is_ok());

        let wrong_qm = MqConfig {
            queue_manager: "QM2".to_string(),
            ..good
        };
        assert!(qm.connect(&wrong_qm).await.is_err());
    }

    #[tokio::test]
    async fn test_message_too_large_is_poison() {
        let qm = Arc::new(InMemoryQueueManager::new("QM1").with_max_message_bytes(4));
        qm.define_queue("KAFKA.OUT");
        let mut session = qm.connect(&config()).await.unwrap();

        let err = session
            .put("KAFKA.OUT", MqMessage::new("too long"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Poison);
    }
}
