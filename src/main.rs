use anyhow::{bail, Context};
use clap::Parser;
use mqbridge::generator;
use mqbridge::health::HealthServer;
use mqbridge::{BridgeConfig, BridgeSupervisor};
use mqbridge_client::kafka::RdKafkaConnector;
use mqbridge_client::mq::{ClientTransportConnector, InMemoryQueueManager};
use mqbridge_client::{KafkaConnector, MqConnector, MqTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Moves messages between IBM MQ and Kafka in both directions.
#[derive(Parser, Debug)]
#[command(name = "mqbridge", version, about)]
struct Args {
    /// Flat JSON config file with dotted keys (`mq.queue.manager`, `kafka.bootstrap.servers`, ...)
    #[arg(long, env = "MQBRIDGE_CONFIG")]
    config: PathBuf,

    /// Overrides `health.bind`
    #[arg(long, env = "MQBRIDGE_HEALTH_BIND")]
    health_bind: Option<SocketAddr>,

    /// Put a random transaction on the source queue every N seconds (memory transport only)
    #[arg(long)]
    generate_every_secs: Option<u64>,
}

fn in_memory_queue_manager(config: &BridgeConfig) -> Arc<InMemoryQueueManager> {
    let mut qm = InMemoryQueueManager::new(config.mq.queue_manager.clone());
    if let (Some(user), Some(password)) = (&config.mq.user, &config.mq.password) {
        qm = qm.with_credentials(user.clone(), password.clone());
    }
    let qm = Arc::new(qm.with_max_message_bytes(config.mq.max_message_bytes));
    for queue in [
        &config.source.queue,
        &config.sink.queue,
        &config.dead_letter.queue,
    ] {
        qm.define_queue(queue);
    }
    qm
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting MQ <-> Kafka bridge");

    let mut config = BridgeConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(bind) = args.health_bind {
        config.health.bind = bind;
    }

    let (mq, demo_qm): (Arc<dyn MqConnector>, Option<Arc<InMemoryQueueManager>>) =
        match config.mq.transport {
            MqTransport::Client => (Arc::new(ClientTransportConnector), None),
            MqTransport::Memory => {
                let qm = in_memory_queue_manager(&config);
                info!("Using in-process queue manager {}", qm.name());
                (Arc::new(Arc::clone(&qm)), Some(qm))
            }
        };
    let kafka: Arc<dyn KafkaConnector> = Arc::new(RdKafkaConnector);

    let generator_source = match (args.generate_every_secs, demo_qm) {
        (Some(0), _) => bail!("--generate-every-secs must be at least 1"),
        (Some(secs), Some(qm)) => Some((qm, Duration::from_secs(secs))),
        (Some(_), None) => bail!("--generate-every-secs requires mq.transport=memory"),
        (None, _) => None,
    };

    let health_bind = config.health.bind;
    let source_queue = config.source.queue.clone();
    let supervisor = BridgeSupervisor::start(config, mq, kafka)?;

    let server = HealthServer::bind(health_bind, supervisor.board())
        .await
        .with_context(|| format!("binding health endpoint to {health_bind}"))?;
    let server_handle = tokio::spawn(server.run(supervisor.stop_signal()));

    let generator_handle = generator_source.map(|(qm, every)| {
        tokio::spawn(generator::run(
            qm,
            source_queue,
            every,
            supervisor.stop_signal(),
        ))
    });

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(()).await;
    });

    let _ = shutdown_rx.recv().await;
    info!("Shutting down");

    supervisor.shutdown().await?;
    server_handle.await?;
    if let Some(handle) = generator_handle {
        handle.await?;
    }

    Ok(())
}
