//! MQ -> Kafka.
//!
//! Messages are read under syncpoint, published, and the MQ unit of work is
//! committed only once Kafka has acknowledged every record of the batch.

use async_trait::async_trait;
use futures::future::join_all;
use mqbridge_client::{
    Classify, ErrorClass, GetOutcome, KafkaConnector, KafkaProducer, MqConnector, MqMessage,
    MqSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterWriter};
use super::{Engine, EngineError, EngineKind, EngineState, StepOutcome};
use crate::health::HealthReporter;
use crate::model::config::BridgeConfig;
use crate::model::message::{hex, BridgeMessage, SourceOffset};
use crate::stages::StagePipeline;
use crate::translator;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SourceEngine {
    config: Arc<BridgeConfig>,
    mq: Arc<dyn MqConnector>,
    kafka: Arc<dyn KafkaConnector>,
    stages: Arc<StagePipeline>,
    reporter: HealthReporter,
    dead_letter: DeadLetterWriter,
    session: Option<Box<dyn MqSession>>,
    producer: Option<Arc<dyn KafkaProducer>>,
}

impl SourceEngine {
    pub fn new(
        config: Arc<BridgeConfig>,
        mq: Arc<dyn MqConnector>,
        kafka: Arc<dyn KafkaConnector>,
        stages: Arc<StagePipeline>,
        reporter: HealthReporter,
    ) -> Self {
        let dead_letter = DeadLetterWriter::from_config(&config.dead_letter);
        Self {
            config,
            mq,
            kafka,
            stages,
            reporter,
            dead_letter,
            session: None,
            producer: None,
        }
    }

    fn queue(&self) -> &str {
        &self.config.source.queue
    }

    async fn collect_batch(
        &self,
        session: &mut Box<dyn MqSession>,
    ) -> Result<Vec<MqMessage>, EngineError> {
        let mut batch = Vec::new();
        let queue = self.config.source.queue.clone();

        match session.get_next(&queue, self.config.poll_timeout).await? {
            GetOutcome::Message(message) => batch.push(message),
            GetOutcome::Empty => return Ok(batch),
        }

        let deadline = Instant::now() + self.config.batch.timeout;
        while batch.len() < self.config.batch.size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match session.get_next(&queue, remaining).await? {
                GetOutcome::Message(message) => batch.push(message),
                GetOutcome::Empty => break,
            }
        }
        Ok(batch)
    }

    async fn translate(&self, message: &MqMessage) -> Result<BridgeMessage, EngineError> {
        let translated = translator::to_kafka(message, self.queue(), &self.config.translator)?;
        Ok(self.stages.apply(translated).await?)
    }

    fn exhausted(&self, message: &MqMessage) -> bool {
        message.backout_count >= self.config.retry.max_retries
    }

    fn dead_letter_for(&self, message: MqMessage, reason: &EngineError) -> DeadLetter {
        let origin = SourceOffset::Mq {
            queue: self.queue().to_string(),
            message_id: message.message_id.clone(),
        };
        DeadLetter {
            payload: message.payload,
            key: message.correlation_id,
            headers: message.properties,
            reason: reason.to_string(),
            origin: origin.to_string(),
        }
    }

    async fn process(
        &self,
        session: &mut Box<dyn MqSession>,
        producer: &Arc<dyn KafkaProducer>,
    ) -> Result<StepOutcome, EngineError> {
        self.reporter.set_state(EngineState::Polling);
        let batch = self.collect_batch(session).await?;
        if batch.is_empty() {
            self.reporter.set_state(EngineState::Idle);
            return Ok(StepOutcome::Idle);
        }
        debug!("Read {} message(s) from {}", batch.len(), self.queue());

        self.reporter.set_state(EngineState::Translating);
        let mut to_publish = Vec::with_capacity(batch.len());
        let mut dead_letters = Vec::new();
        for message in batch {
            match self.translate(&message).await {
                Ok(translated) => to_publish.push((message, translated)),
                Err(e) if e.class() == ErrorClass::Poison => {
                    if !self.exhausted(&message) {
                        warn!(
                            "Message {} from {} failed ({}), attempt {} of {}; backing out",
                            hex(&message.message_id),
                            self.queue(),
                            e,
                            message.backout_count + 1,
                            self.config.retry.max_retries + 1
                        );
                        session.backout().await?;
                        return Ok(StepOutcome::Retried);
                    }
                    dead_letters.push(self.dead_letter_for(message, &e));
                }
                Err(e) => return Err(e),
            }
        }

        self.reporter.set_state(EngineState::Publishing);
        let topic = &self.config.source.topic;
        let receipts = join_all(
            to_publish
                .iter()
                .map(|(_, translated)| producer.produce(translated.to_produce_record(topic))),
        )
        .await;

        let mut delivered = 0;
        let mut retry = false;
        for ((message, _), receipt) in to_publish.into_iter().zip(receipts) {
            match receipt {
                Ok(receipt) => {
                    delivered += 1;
                    debug!(
                        "Published {} to {}/{}@{}",
                        hex(&message.message_id),
                        receipt.topic,
                        receipt.partition,
                        receipt.offset
                    );
                }
                Err(e) if e.class() == ErrorClass::Poison => {
                    if self.exhausted(&message) {
                        let reason = EngineError::from(e);
                        dead_letters.push(self.dead_letter_for(message, &reason));
                    } else {
                        warn!(
                            "Kafka rejected message {}: {}; backing out",
                            hex(&message.message_id),
                            e
                        );
                        retry = true;
                    }
                }
                Err(e) => {
                    warn!("Publishing to {} failed: {}; backing out batch", topic, e);
                    session.backout().await?;
                    return Err(e.into());
                }
            }
        }
        if retry {
            session.backout().await?;
            return Ok(StepOutcome::Retried);
        }

        let dead_lettered = dead_letters.len();
        for dead_letter in dead_letters {
            self.dead_letter
                .write(session, Some(producer), dead_letter)
                .await?;
        }

        self.reporter.set_state(EngineState::Committing);
        session.commit().await?;
        self.reporter.set_state(EngineState::Idle);
        Ok(StepOutcome::Transferred {
            delivered,
            dead_lettered,
        })
    }
}

#[async_trait]
impl Engine for SourceEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Source
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        self.disconnect().await;
        self.reporter.set_state(EngineState::Connecting);
        let session = self.mq.connect(&self.config.mq).await?;
        let producer = self.kafka.producer(&self.config.kafka).await?;
        info!(
            "Source engine connected: {} -> {}",
            self.config.source.queue, self.config.source.topic
        );
        self.session = Some(session);
        self.producer = Some(producer);
        self.reporter.set_state(EngineState::Idle);
        Ok(())
    }

    async fn step(&mut self) -> Result<StepOutcome, EngineError> {
        let (Some(mut session), Some(producer)) = (self.session.take(), self.producer.clone())
        else {
            self.connect().await?;
            return Ok(StepOutcome::Idle);
        };

        let result = self.process(&mut session, &producer).await;
        if result.is_err() && session.in_transaction() {
            if let Err(e) = session.backout().await {
                debug!("Backout after failure also failed: {}", e);
            }
        }
        self.session = Some(session);
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
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT).await {
                debug!("Flush on disconnect failed: {}", e);
            }
        }
    }
}
