//! Runs every engine on its own task and keeps it running.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use mqbridge_client::{Classify, KafkaConnector, MqConnector};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::concurrency::attempts::AttemptTracker;
use crate::engine::{Engine, EngineKind, EngineState, SinkEngine, SourceEngine, StepOutcome};
use crate::health::{HealthReporter, HealthSnapshot, StatusBoard};
use crate::model::config::{BridgeConfig, RetryConfig};
use crate::stages::{StageError, StagePipeline};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to set up message stages: {0}")]
    Stage(#[from] StageError),

    #[error("Engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Exponential restart delay: `initial`, doubling on every failure, capped at `max`.
pub fn restart_backoff(retry: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(retry.backoff_initial)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(retry.backoff_max)
        .with_max_elapsed_time(None)
        .build()
}

pub struct BridgeSupervisor {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    board: Arc<StatusBoard>,
}

impl BridgeSupervisor {
    /// Spawns `source.tasks` source engines and `sink.tasks` sink engines.
    pub fn start(
        config: BridgeConfig,
        mq: Arc<dyn MqConnector>,
        kafka: Arc<dyn KafkaConnector>,
    ) -> Result<Self, SupervisorError> {
        let config = Arc::new(config);
        let stages = Arc::new(StagePipeline::from_config(&config.stages)?);
        let attempts = Arc::new(AttemptTracker::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut engines: Vec<(Box<dyn Engine>, HealthReporter)> = Vec::new();
        let mut receivers = Vec::new();

        if config.source.enabled {
            for i in 0..config.source.tasks {
                let (reporter, rx) = HealthReporter::new(format!("source-{i}"), EngineKind::Source);
                let engine = SourceEngine::new(
                    Arc::clone(&config),
                    Arc::clone(&mq),
                    Arc::clone(&kafka),
                    Arc::clone(&stages),
                    reporter.clone(),
                );
                engines.push((Box::new(engine), reporter));
                receivers.push(rx);
            }
        }
        if config.sink.enabled {
            for i in 0..config.sink.tasks {
                let (reporter, rx) = HealthReporter::new(format!("sink-{i}"), EngineKind::Sink);
                let engine = SinkEngine::new(
                    Arc::clone(&config),
                    Arc::clone(&mq),
                    Arc::clone(&kafka),
                    Arc::clone(&stages),
                    reporter.clone(),
                    Arc::clone(&attempts),
                );
                engines.push((Box::new(engine), reporter));
                receivers.push(rx);
            }
        }

        info!(
            "Starting bridge: {} source engine(s) {} -> {}, {} sink engine(s) {} -> {}",
            if config.source.enabled { config.source.tasks } else { 0 },
            config.source.queue,
            config.source.topic,
            if config.sink.enabled { config.sink.tasks } else { 0 },
            config.sink.topic,
            config.sink.queue
        );

        let tasks = engines
            .into_iter()
            .map(|(engine, reporter)| {
                tokio::spawn(run_engine(
                    engine,
                    reporter,
                    config.retry.clone(),
                    stop_rx.clone(),
                ))
            })
            .collect();

        Ok(Self {
            stop_tx,
            tasks,
            board: Arc::new(StatusBoard::new(receivers)),
        })
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.board.snapshot()
    }

    /// Turns true once shutdown has been requested.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Stops every engine after its current unit of work and waits for them.
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        info!("Stopping bridge");
        self.stop_tx.send_replace(true);
        for task in self.tasks {
            task.await?;
        }
        info!("Bridge stopped");
        Ok(())
    }
}

/// Resolves once `stop` turns true or its sender goes away.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn run_engine(
    mut engine: Box<dyn Engine>,
    reporter: HealthReporter,
    retry: RetryConfig,
    mut stop: watch::Receiver<bool>,
) {
    let name = reporter.status().name;
    let mut backoff = restart_backoff(&retry);
    let mut connected = false;

    loop {
        if *stop.borrow() {
            break;
        }

        let result = if connected {
            engine.step().await.map(Some)
        } else {
            engine.connect().await.map(|()| None)
        };

        match result {
            Ok(None) => connected = true,
            Ok(Some(StepOutcome::Transferred {
                delivered,
                dead_lettered,
            })) => {
                reporter.record_success(delivered, dead_lettered);
                backoff.reset();
            }
            Ok(Some(StepOutcome::Idle | StepOutcome::Retried)) => {}
            Err(e) => {
                let failures = reporter.record_failure(&e);
                engine.disconnect().await;
                connected = false;

                // A poison error that got this far was not dead-lettered;
                // restarting would replay the same message forever.
                if !e.is_retryable() {
                    error!("Engine {} failed permanently ({}): {}", name, e.class(), e);
                    reporter.set_state(EngineState::Failed);
                    return;
                }

                let delay = backoff.next_backoff().unwrap_or(retry.backoff_max);
                warn!(
                    "Engine {} failed ({} {} in a row): {}; restarting in {:?}",
                    name,
                    e.class(),
                    failures,
                    e,
                    delay
                );
                reporter.set_state(EngineState::Restarting);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(&mut stop) => break,
                }
                reporter.record_restart();
            }
        }
    }

    engine.disconnect().await;
    reporter.set_state(EngineState::Stopped);
}
