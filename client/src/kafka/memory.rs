//! In-process Kafka cluster for local runs and tests.
//!
//! Topics are partitioned logs, consumer groups keep committed offsets, and
//! partitions are split among the live members of a group by index modulo
//! member count. Taking the cluster offline makes every produce and poll fail
//! with a transient error until it comes back.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    earliest_offsets, next_offsets, CommitHandle, DeliveryReceipt, KafkaConfig, KafkaConnector,
    KafkaConsumer, KafkaError, KafkaProducer, KafkaRecord, ProduceRecord,
};
use crate::Header;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<Header>,
    timestamp: i64,
}

#[derive(Default)]
struct ClusterState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, String, i32), i64>,
    members: HashMap<(String, String), BTreeSet<u64>>,
    round_robin: u64,
}

impl ClusterState {
    fn assigned_partitions(&self, group: &str, topic: &str, member: u64) -> Vec<i32> {
        let partitions = self.topics.get(topic).map(Vec::len).unwrap_or(0);
        let members = match self.members.get(&(group.to_string(), topic.to_string())) {
            Some(members) if !members.is_empty() => members,
            _ => return Vec::new(),
        };
        let index = match members.iter().position(|m| *m == member) {
            Some(index) => index,
            None => return Vec::new(),
        };
        (0..partitions)
            .filter(|p| p % members.len() == index)
            .map(|p| p as i32)
            .collect()
    }
}

pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    notify: Notify,
    available: AtomicBool,
    max_message_bytes: usize,
    next_member: AtomicU64,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            max_message_bytes: 1024 * 1024,
            next_member: AtomicU64::new(1),
        }
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.state()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(
            "Kafka cluster is now {}",
            if available { "available" } else { "unavailable" }
        );
        self.notify.notify_waiters();
    }

    /// Every record of a topic, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<KafkaRecord> {
        let state = self.state();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter()
                    .enumerate()
                    .map(move |(offset, stored)| to_record(topic, partition as i32, offset, stored))
            })
            .collect()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Appends directly to a partition, bypassing availability checks.
    pub fn append(&self, topic: &str, partition: i32, record: ProduceRecord) -> i64 {
        let offset = {
            let mut state = self.state();
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new()]);
            let index = (partition.max(0) as usize).min(log.len() - 1);
            log[index].push(stored(record));
            (log[index].len() - 1) as i64
        };
        self.notify.notify_waiters();
        offset
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), KafkaError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KafkaError::Unavailable(
                "all brokers are down".to_string(),
            ))
        }
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn stored(record: ProduceRecord) -> StoredRecord {
    StoredRecord {
        key: record.key,
        value: Some(record.value),
        headers: record.headers,
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

fn to_record(topic: &str, partition: i32, offset: usize, stored: &StoredRecord) -> KafkaRecord {
    KafkaRecord {
        topic: topic.to_string(),
        partition,
        offset: offset as i64,
        key: stored.key.clone(),
        value: stored.value.clone(),
        headers: stored.headers.clone(),
        timestamp: Some(stored.timestamp),
    }
}

fn partition_for(key: Option<&Bytes>, partitions: usize, round_robin: &mut u64) -> usize {
    match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as usize
        }
        None => {
            *round_robin += 1;
            (*round_robin % partitions as u64) as usize
        }
    }
}

#[async_trait]
impl KafkaProducer for Arc<InMemoryCluster> {
    async fn produce(&self, record: ProduceRecord) -> Result<DeliveryReceipt, KafkaError> {
        self.check_available()?;
        let size = record.size();
        if size > self.max_message_bytes {
            return Err(KafkaError::MessageTooLarge {
                size,
                max: self.max_message_bytes,
            });
        }

        let receipt = {
            let mut state = self.state();
            let state = &mut *state;
            let log = state
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| KafkaError::UnknownTopic(record.topic.clone()))?;
            let partition = partition_for(record.key.as_ref(), log.len(), &mut state.round_robin);
            let topic = record.topic.clone();
            log[partition].push(stored(record));
            DeliveryReceipt {
                topic,
                partition: partition as i32,
                offset: (log[partition].len() - 1) as i64,
            }
        };
        self.notify.notify_waiters();
        Ok(receipt)
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), KafkaError> {
        self.check_available()
    }
}

#[async_trait]
impl KafkaConnector for Arc<InMemoryCluster> {
    async fn producer(&self, _config: &KafkaConfig) -> Result<Arc<dyn KafkaProducer>, KafkaError> {
        self.check_available()?;
        Ok(Arc::new(Arc::clone(self)))
    }

    async fn consume(
        &self,
        _config: &KafkaConfig,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn KafkaConsumer>, KafkaError> {
        self.check_available()?;
        let member = self.next_member.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state();
            if !state.topics.contains_key(topic) {
                return Err(KafkaError::UnknownTopic(topic.to_string()));
            }
            state
                .members
                .entry((group_id.to_string(), topic.to_string()))
                .or_default()
                .insert(member);
        }
        debug!("Member {} joined group {} on {}", member, group_id, topic);

        Ok(Box::new(InMemoryConsumer {
            cluster: Arc::clone(self),
            group: group_id.to_string(),
            topic: topic.to_string(),
            member,
            positions: HashMap::new(),
        }))
    }
}

pub struct InMemoryConsumer {
    cluster: Arc<InMemoryCluster>,
    group: String,
    topic: String,
    member: u64,
    positions: HashMap<i32, i64>,
}

impl InMemoryConsumer {
    fn try_next(&mut self) -> Option<KafkaRecord> {
        let state = self.cluster.state();
        let assigned = state.assigned_partitions(&self.group, &self.topic, self.member);
        self.positions.retain(|p, _| assigned.contains(p));
        let log = state.topics.get(&self.topic)?;

        for partition in assigned {
            let position = *self.positions.entry(partition).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.group.clone(), self.topic.clone(), partition))
                    .copied()
                    .unwrap_or(0)
            });
            if let Some(stored) = log[partition as usize].get(position as usize) {
                self.positions.insert(partition, position + 1);
                return Some(to_record(&self.topic, partition, position as usize, stored));
            }
        }
        None
    }
}

#[async_trait]
impl KafkaConsumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<KafkaRecord>, KafkaError> {
        let deadline = Instant::now() + timeout;
        let cluster = Arc::clone(&self.cluster);

        loop {
            let notified = cluster.notify.notified();
            cluster.check_available()?;
            if let Some(record) = self.try_next() {
                return Ok(Some(record));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn commit(&mut self, handles: &[CommitHandle]) -> Result<(), KafkaError> {
        self.cluster.check_available()?;
        let mut state = self.cluster.state();
        for ((topic, partition), offset) in next_offsets(handles) {
            state
                .committed
                .insert((self.group.clone(), topic, partition), offset);
        }
        Ok(())
    }

    async fn rewind(&mut self, handles: &[CommitHandle]) -> Result<(), KafkaError> {
        for ((topic, partition), offset) in earliest_offsets(handles) {
            if topic == self.topic {
                self.positions.insert(partition, offset);
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        let mut state = self.cluster.state();
        if let Some(members) = state
            .members
            .get_mut(&(self.group.clone(), self.topic.clone()))
        {
            members.remove(&self.member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Classify, ErrorClass};

    fn record(topic: &str, key: Option<&'static str>, value: &'static str) -> ProduceRecord {
        ProduceRecord {
            topic: topic.to_string(),
            key: key.map(Bytes::from),
            value: Bytes::from(value),
            headers: vec![Header::new("h", "v")],
        }
    }

    fn cluster(partitions: usize) -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.create_topic("t", partitions);
        cluster
    }

    #[tokio::test]
    async fn test_produce_then_consume() {
        let cluster = cluster(1);
        let config = KafkaConfig::default();
        let producer = cluster.producer(&config).await.unwrap();

        let receipt = producer.produce(record("t", Some("k"), "v1")).await.unwrap();
        assert_eq!(receipt.offset, 0);

        let mut consumer = cluster.consume(&config, "t", "g").await.unwrap();
        let consumed = consumer
            .poll(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumed.key, Some(Bytes::from("k")));
        assert_eq!(consumed.value, Some(Bytes::from("v1")));
        assert_eq!(consumed.headers, vec![Header::new("h", "v")]);
        assert!(consumer
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_new_member_resumes_from_committed_offset() {
        let cluster = cluster(1);
        let config = KafkaConfig::default();
        for value in ["a", "b", "c"] {
            cluster.append("t", 0, record("t", None, value));
        }

        {
            let mut consumer = cluster.consume(&config, "t", "g").await.unwrap();
            let first = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            let _second = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            consumer.commit(&[first.handle()]).await.unwrap();
        }
        assert_eq!(cluster.committed_offset("g", "t", 0), Some(1));

        let mut consumer = cluster.consume(&config, "t", "g").await.unwrap();
        let next = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(next.value, Some(Bytes::from("b")));
    }

    #[tokio::test]
    async fn test_rewind_redelivers() {
        let cluster = cluster(1);
        let config = KafkaConfig::default();
        cluster.append("t", 0, record("t", None, "a"));
        cluster.append("t", 0, record("t", None, "b"));

        let mut consumer = cluster.consume(&config, "t", "g").await.unwrap();
        let a = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        let b = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        consumer.rewind(&[b.handle(), a.handle()]).await.unwrap();

        let again = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.offset, 0);
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let cluster = cluster(4);
        let config = KafkaConfig::default();
        for partition in 0..4 {
            cluster.append("t", partition, record("t", None, "x"));
        }

        let mut first = cluster.consume(&config, "t", "g").await.unwrap();
        let mut second = cluster.consume(&config, "t", "g").await.unwrap();

        let mut seen = BTreeSet::new();
        for consumer in [&mut first, &mut second] {
            while let Some(r) = consumer.poll(Duration::from_millis(10)).await.unwrap() {
                assert!(seen.insert(r.partition), "partition delivered twice");
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_cluster_is_transient() {
        let cluster = cluster(1);
        let config = KafkaConfig::default();
        let producer = cluster.producer(&config).await.unwrap();

        cluster.set_available(false);
        let err = producer.produce(record("t", None, "x")).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);

        cluster.set_available(true);
        assert!(producer.produce(record("t", None, "x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_topic_and_oversize() {
        let cluster = Arc::new(InMemoryCluster::new().with_max_message_bytes(3));
        cluster.create_topic("t", 1);
        let producer = cluster.producer(&KafkaConfig::default()).await.unwrap();

        let err = producer
            .produce(record("missing", None, "x"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = producer
            .produce(record("t", None, "four"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Poison);
    }
}
