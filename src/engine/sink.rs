//! Kafka -> MQ.
//!
//! Records are put to the target queue under syncpoint in consumption order.
//! Offsets are committed only after the MQ commit succeeds; until then a
//! failure leaves the consumer group to redeliver from the last committed
//! offset.

use async_trait::async_trait;
use mqbridge_client::{
    Classify, CommitHandle, ErrorClass, KafkaConnector, KafkaConsumer, KafkaProducer, KafkaRecord,
    MqConnector, MqSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterWriter};
use super::{Engine, EngineError, EngineKind, EngineState, StepOutcome};
use crate::concurrency::attempts::AttemptTracker;
use crate::health::HealthReporter;
use crate::model::config::BridgeConfig;
use crate::model::message::{BridgeMessage, SourceOffset};
use crate::stages::StagePipeline;
use crate::translator;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SinkEngine {
    config: Arc<BridgeConfig>,
    mq: Arc<dyn MqConnector>,
    kafka: Arc<dyn KafkaConnector>,
    stages: Arc<StagePipeline>,
    reporter: HealthReporter,
    attempts: Arc<AttemptTracker>,
    dead_letter: DeadLetterWriter,
    session: Option<Box<dyn MqSession>>,
    consumer: Option<Box<dyn KafkaConsumer>>,
    dead_letter_producer: Option<Arc<dyn KafkaProducer>>,
}

enum Planned {
    Put(KafkaRecord, BridgeMessage),
    DeadLetter(DeadLetter),
}

/// How a batch ended before reaching the commit.
enum Interrupted {
    Retry,
    Failed(EngineError),
}

impl From<EngineError> for Interrupted {
    fn from(err: EngineError) -> Self {
        Interrupted::Failed(err)
    }
}

impl SinkEngine {
    pub fn new(
        config: Arc<BridgeConfig>,
        mq: Arc<dyn MqConnector>,
        kafka: Arc<dyn KafkaConnector>,
        stages: Arc<StagePipeline>,
        reporter: HealthReporter,
        attempts: Arc<AttemptTracker>,
    ) -> Self {
        let dead_letter = DeadLetterWriter::from_config(&config.dead_letter);
        Self {
            config,
            mq,
            kafka,
            stages,
            reporter,
            attempts,
            dead_letter,
            session: None,
            consumer: None,
            dead_letter_producer: None,
        }
    }

    async fn collect_batch(
        &self,
        consumer: &mut Box<dyn KafkaConsumer>,
    ) -> Result<Vec<KafkaRecord>, EngineError> {
        let mut batch = Vec::new();
        match consumer.poll(self.config.poll_timeout).await? {
            Some(record) => batch.push(record),
            None => return Ok(batch),
        }

        let deadline = Instant::now() + self.config.batch.timeout;
        while batch.len() < self.config.batch.size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match consumer.poll(remaining).await? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }

    async fn translate(&self, record: &KafkaRecord) -> Result<BridgeMessage, EngineError> {
        let translated = translator::to_mq(record, &self.config.translator)?;
        Ok(self.stages.apply(translated).await?)
    }

    /// Counts a poison failure and tells whether the record has used up its retries.
    fn exhausted(&self, record: &KafkaRecord, error: &EngineError) -> bool {
        let failures = self.attempts.record_failure(&record.handle());
        let exhausted = failures > self.config.retry.max_retries;
        if !exhausted {
            warn!(
                "Record {}/{}@{} failed ({}), attempt {} of {}",
                record.topic,
                record.partition,
                record.offset,
                error,
                failures,
                self.config.retry.max_retries + 1
            );
        }
        exhausted
    }

    fn dead_letter_for(record: &KafkaRecord, reason: &EngineError) -> DeadLetter {
        let origin = SourceOffset::Kafka {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        };
        DeadLetter {
            payload: record.value.clone().unwrap_or_default(),
            key: record.key.clone(),
            headers: record.headers.clone(),
            reason: reason.to_string(),
            origin: origin.to_string(),
        }
    }

    async fn send_dead_letter(
        &self,
        session: &mut Box<dyn MqSession>,
        dead_letter: DeadLetter,
    ) -> Result<(), EngineError> {
        self.dead_letter
            .write(session, self.dead_letter_producer.as_ref(), dead_letter)
            .await
    }

    /// Translates and puts the batch. Nothing is committed.
    async fn put_batch(
        &self,
        session: &mut Box<dyn MqSession>,
        batch: Vec<KafkaRecord>,
    ) -> Result<(usize, usize), Interrupted> {
        self.reporter.set_state(EngineState::Translating);
        let mut planned = Vec::with_capacity(batch.len());
        for record in batch {
            match self.translate(&record).await {
                Ok(translated) => planned.push(Planned::Put(record, translated)),
                Err(e) if e.class() == ErrorClass::Poison => {
                    if !self.exhausted(&record, &e) {
                        return Err(Interrupted::Retry);
                    }
                    planned.push(Planned::DeadLetter(Self::dead_letter_for(&record, &e)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.reporter.set_state(EngineState::Putting);
        let queue = &self.config.sink.queue;
        let (mut delivered, mut dead_lettered) = (0, 0);
        for item in planned {
            match item {
                Planned::Put(record, translated) => {
                    match session.put(queue, translated.to_mq_message()).await {
                        Ok(()) => {
                            delivered += 1;
                            debug!(
                                "Put {}/{}@{} to {}",
                                record.topic, record.partition, record.offset, queue
                            );
                        }
                        Err(e) if e.class() == ErrorClass::Poison => {
                            let err = EngineError::from(e);
                            if !self.exhausted(&record, &err) {
                                return Err(Interrupted::Retry);
                            }
                            self.send_dead_letter(session, Self::dead_letter_for(&record, &err))
                                .await?;
                            dead_lettered += 1;
                        }
                        Err(e) => return Err(EngineError::from(e).into()),
                    }
                }
                Planned::DeadLetter(dead_letter) => {
                    self.send_dead_letter(session, dead_letter).await?;
                    dead_lettered += 1;
                }
            }
        }
        Ok((delivered, dead_lettered))
    }

    async fn process(
        &self,
        session: &mut Box<dyn MqSession>,
        consumer: &mut Box<dyn KafkaConsumer>,
    ) -> Result<StepOutcome, EngineError> {
        self.reporter.set_state(EngineState::Consuming);
        let batch = self.collect_batch(consumer).await?;
        if batch.is_empty() {
            self.reporter.set_state(EngineState::Idle);
            return Ok(StepOutcome::Idle);
        }
        let handles: Vec<CommitHandle> = batch.iter().map(KafkaRecord::handle).collect();
        debug!(
            "Consumed {} record(s) from {}",
            handles.len(),
            self.config.sink.topic
        );

        let (delivered, dead_lettered) = match self.put_batch(session, batch).await {
            Ok(counts) => counts,
            Err(Interrupted::Retry) => {
                session.backout().await?;
                consumer.rewind(&handles).await?;
                return Ok(StepOutcome::Retried);
            }
            Err(Interrupted::Failed(e)) => {
                warn!("Putting to {} failed: {}; backing out batch", self.config.sink.queue, e);
                return Err(e);
            }
        };

        self.reporter.set_state(EngineState::Committing);
        session.commit().await?;
        consumer.commit(&handles).await?;
        self.attempts.clear(&handles);
        self.reporter.set_state(EngineState::Idle);
        Ok(StepOutcome::Transferred {
            delivered,
            dead_lettered,
        })
    }
}

#[async_trait]
impl Engine for SinkEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Sink
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        self.disconnect().await;
        self.reporter.set_state(EngineState::Connecting);
        let session = self.mq.connect(&self.config.mq).await?;
        let consumer = self
            .kafka
            .consume(&self.config.kafka, &self.config.sink.topic, &self.config.sink.group_id)
            .await?;
        if self.dead_letter.topic().is_some() {
            self.dead_letter_producer = Some(self.kafka.producer(&self.config.kafka).await?);
        }
        info!(
            "Sink engine connected: {} -> {} (group {})",
            self.config.sink.topic, self.config.sink.queue, self.config.sink.group_id
        );
        self.session = Some(session);
        self.consumer = Some(consumer);
        self.reporter.set_state(EngineState::Idle);
        Ok(())
    }

    async fn step(&mut self) -> Result<StepOutcome, EngineError> {
        let (Some(mut session), Some(mut consumer)) = (self.session.take(), self.consumer.take())
        else {
            self.connect().await?;
            return Ok(StepOutcome::Idle);
        };

        let result = self.process(&mut session, &mut consumer).await;
        if result.is_err() && session.in_transaction() {
            if let Err(e) = session.backout().await {
                debug!("Backout after failure also failed: {}", e);
            }
        }
        self.session = Some(session);
        self.consumer = Some(consumer);
        result
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.in_transaction() {
                if let Err(e) = session.backout().await {
                    debug!("Backout on disconnect failed: {}", e);
                }
            }
        }
        self.consumer = None;
        if let Some(producer) = self.dead_letter_producer.take() {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT).await {
                debug!("Flush on disconnect failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dead_letter::ORIGIN_HEADER;
    use crate::engine::testing;
    use bytes::Bytes;
    use mqbridge_client::kafka::InMemoryCluster;
    use mqbridge_client::mq::InMemoryQueueManager;
    use mqbridge_client::{find_header, Header, ProduceRecord};

    struct Fixture {
        qm: Arc<InMemoryQueueManager>,
        cluster: Arc<InMemoryCluster>,
        attempts: Arc<AttemptTracker>,
        engine: SinkEngine,
    }

    async fn fixture(json: &str) -> Fixture {
        let qm = testing::queue_manager();
        let cluster = testing::cluster();
        let config = Arc::new(testing::config(json));
        let stages = Arc::new(StagePipeline::from_config(&config.stages).unwrap());
        let attempts = Arc::new(AttemptTracker::new());
        let (reporter, _) = testing::reporter(EngineKind::Sink);
        let mut engine = SinkEngine::new(
            config,
            Arc::new(qm.clone()),
            Arc::new(cluster.clone()),
            stages,
            reporter,
            attempts.clone(),
        );
        engine.connect().await.unwrap();
        Fixture {
            qm,
            cluster,
            attempts,
            engine,
        }
    }

    fn record(key: Option<&'static str>, value: &'static str) -> ProduceRecord {
        ProduceRecord {
            topic: "mq-messages-out".to_string(),
            key: key.map(Bytes::from),
            value: Bytes::from(value),
            headers: vec![Header::new("source", "orders")],
        }
    }

    #[tokio::test]
    async fn test_puts_then_commits_offset() {
        let mut f = fixture(r#"{"poll.timeout.ms": 50}"#).await;
        f.cluster
            .append("mq-messages-out", 0, record(Some("abc123"), "hello"));

        let outcome = f.engine.step().await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Transferred {
                delivered: 1,
                dead_lettered: 0
            }
        );

        let out = f.qm.browse("KAFKA.OUT");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, Bytes::from("hello"));
        assert_eq!(out[0].correlation_id, Some(Bytes::from("abc123")));
        assert_eq!(out[0].properties, vec![Header::new("source", "orders")]);
        assert_eq!(
            f.cluster.committed_offset("mqbridge", "mq-messages-out", 0),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_mq_failure_leaves_offset_uncommitted() {
        let mut f = fixture(r#"{"poll.timeout.ms": 50}"#).await;
        f.cluster.append("mq-messages-out", 0, record(None, "hello"));
        f.qm.set_available(false);

        let err = f.engine.step().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(f.cluster.committed_offset("mqbridge", "mq-messages-out", 0), None);

        f.qm.set_available(true);
        f.engine.connect().await.unwrap();
        assert!(matches!(
            f.engine.step().await.unwrap(),
            StepOutcome::Transferred { delivered: 1, .. }
        ));
        assert_eq!(f.qm.depth("KAFKA.OUT"), 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_retried_without_loss() {
        let qm = Arc::new(InMemoryQueueManager::new("QM1"));
        qm.define_queue_with_depth("KAFKA.OUT", 0);
        let cluster = testing::cluster();
        let config = Arc::new(testing::config(r#"{"poll.timeout.ms": 50}"#));
        let (reporter, _) = testing::reporter(EngineKind::Sink);
        let mut engine = SinkEngine::new(
            config,
            Arc::new(qm.clone()),
            Arc::new(cluster.clone()),
            Arc::new(StagePipeline::new()),
            reporter,
            Arc::new(AttemptTracker::new()),
        );
        engine.connect().await.unwrap();
        cluster.append("mq-messages-out", 1, record(None, "hello"));

        let err = engine.step().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(cluster.committed_offset("mqbridge", "mq-messages-out", 1), None);
        assert_eq!(qm.depth("KAFKA.OUT"), 0);
    }

    #[tokio::test]
    async fn test_preserves_partition_order() {
        let mut f =
            fixture(r#"{"poll.timeout.ms": 50, "batch.size": 3, "batch.timeout.ms": 20}"#).await;
        for value in ["m0", "m1", "m2", "m3", "m4", "m5"] {
            f.cluster.append("mq-messages-out", 2, record(None, value));
        }

        let mut transferred = 0;
        while transferred < 6 {
            if let StepOutcome::Transferred { delivered, .. } = f.engine.step().await.unwrap() {
                transferred += delivered;
            }
        }

        let payloads: Vec<Bytes> =
            f.qm.browse("KAFKA.OUT").into_iter().map(|m| m.payload).collect();
        let expected: Vec<Bytes> = ["m0", "m1", "m2", "m3", "m4", "m5"]
            .into_iter()
            .map(Bytes::from)
            .collect();
        assert_eq!(payloads, expected);
        assert_eq!(
            f.cluster.committed_offset("mqbridge", "mq-messages-out", 2),
            Some(6)
        );
    }

    #[tokio::test]
    async fn test_poison_record_retried_then_dead_lettered() {
        let mut schema = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut schema, br#"{"type": "object"}"#).unwrap();
        let json = format!(
            r#"{{"poll.timeout.ms": 50, "batch.size": 3, "batch.timeout.ms": 20, "max.retries": 1,
                "payload.schema.path": "{}"}}"#,
            schema.path().display()
        );
        let mut f = fixture(&json).await;
        f.cluster.append("mq-messages-out", 0, record(None, "{\"n\": 1}"));
        f.cluster.append("mq-messages-out", 0, record(None, "not json"));
        f.cluster.append("mq-messages-out", 0, record(None, "{\"n\": 3}"));

        assert_eq!(f.engine.step().await.unwrap(), StepOutcome::Retried);
        assert_eq!(f.qm.depth("KAFKA.OUT"), 0);
        assert_eq!(f.attempts.len(), 1);

        assert_eq!(
            f.engine.step().await.unwrap(),
            StepOutcome::Transferred {
                delivered: 2,
                dead_lettered: 1
            }
        );
        assert!(f.attempts.is_empty());

        let out: Vec<Bytes> = f.qm.browse("KAFKA.OUT").into_iter().map(|m| m.payload).collect();
        assert_eq!(out, vec![Bytes::from("{\"n\": 1}"), Bytes::from("{\"n\": 3}")]);

        let dead = f.qm.browse("SYSTEM.DEAD.LETTER.QUEUE");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, Bytes::from("not json"));
        assert_eq!(
            find_header(&dead[0].properties, ORIGIN_HEADER).map(|h| h.value.clone()),
            Some(Bytes::from("kafka:mq-messages-out/0@1"))
        );
        assert_eq!(
            f.cluster.committed_offset("mqbridge", "mq-messages-out", 0),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_dead_letter_topic() {
        let mut f = fixture(
            r#"{"poll.timeout.ms": 50, "max.retries": 0, "dead.letter.topic": "mq-bridge-dlt"}"#,
        )
        .await;
        f.cluster.append(
            "mq-messages-out",
            0,
            record(Some("a-key-that-is-much-longer-than-24-bytes"), "p"),
        );

        assert_eq!(
            f.engine.step().await.unwrap(),
            StepOutcome::Transferred {
                delivered: 0,
                dead_lettered: 1
            }
        );
        let dead = f.cluster.records("mq-bridge-dlt");
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].key,
            Some(Bytes::from("a-key-that-is-much-longer-than-24-bytes"))
        );
        assert_eq!(f.qm.depth("KAFKA.OUT"), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_rejected_everywhere_is_fatal() {
        let qm = Arc::new(InMemoryQueueManager::new("QM1").with_max_message_bytes(8));
        for queue in ["KAFKA.OUT", "SYSTEM.DEAD.LETTER.QUEUE"] {
            qm.define_queue(queue);
        }
        let cluster = Arc::new(InMemoryCluster::new().with_max_message_bytes(8));
        for topic in ["mq-messages-out", "mq-bridge-dlt"] {
            cluster.create_topic(topic, 1);
        }
        let config = Arc::new(testing::config(
            r#"{"poll.timeout.ms": 50, "max.retries": 0, "dead.letter.topic": "mq-bridge-dlt"}"#,
        ));
        let (reporter, _) = testing::reporter(EngineKind::Sink);
        let mut engine = SinkEngine::new(
            config,
            Arc::new(qm.clone()),
            Arc::new(cluster.clone()),
            Arc::new(StagePipeline::new()),
            reporter,
            Arc::new(AttemptTracker::new()),
        );
        engine.connect().await.unwrap();
        for value in ["this payload is too large", "ok"] {
            cluster.append(
                "mq-messages-out",
                0,
                ProduceRecord {
                    topic: "mq-messages-out".to_string(),
                    key: None,
                    value: Bytes::from(value),
                    headers: Vec::new(),
                },
            );
        }

        let err = engine.step().await.unwrap_err();
        assert!(matches!(err, EngineError::DeadLetterRejected { .. }));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(cluster.records("mq-bridge-dlt").is_empty());
        assert_eq!(qm.depth("SYSTEM.DEAD.LETTER.QUEUE"), 0);
        assert_eq!(qm.depth("KAFKA.OUT"), 0);
        assert_eq!(cluster.committed_offset("mqbridge", "mq-messages-out", 0), None);
    }

    #[tokio::test]
    async fn test_crash_before_offset_commit_redelivers() {
        let qm = testing::queue_manager();
        let cluster = testing::cluster();
        let config = Arc::new(testing::config(r#"{"poll.timeout.ms": 50}"#));
        let crashing = testing::CrashingQueueManager::new(
            qm.clone(),
            testing::Crash::AfterMqCommit,
        );
        let crashed = Arc::clone(&crashing.crashed);
        let (reporter, _) = testing::reporter(EngineKind::Sink);
        let mut engine = SinkEngine::new(
            Arc::clone(&config),
            Arc::new(crashing),
            Arc::new(cluster.clone()),
            Arc::new(StagePipeline::new()),
            reporter,
            Arc::new(AttemptTracker::new()),
        );
        engine.connect().await.unwrap();
        cluster.append("mq-messages-out", 0, record(Some("abc123"), "hello"));

        let task = tokio::spawn(async move { engine.step().await });
        crashed.notified().await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // The put is durable but the offset never made it.
        assert_eq!(qm.depth("KAFKA.OUT"), 1);
        assert_eq!(cluster.committed_offset("mqbridge", "mq-messages-out", 0), None);

        let (reporter, _) = testing::reporter(EngineKind::Sink);
        let mut restarted = SinkEngine::new(
            config,
            Arc::new(qm.clone()),
            Arc::new(cluster.clone()),
            Arc::new(StagePipeline::new()),
            reporter,
            Arc::new(AttemptTracker::new()),
        );
        restarted.connect().await.unwrap();
        assert!(matches!(
            restarted.step().await.unwrap(),
            StepOutcome::Transferred { delivered: 1, .. }
        ));

        let out = qm.browse("KAFKA.OUT");
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.payload == Bytes::from("hello")));
        assert_eq!(
            cluster.committed_offset("mqbridge", "mq-messages-out", 0),
            Some(1)
        );
    }
}
