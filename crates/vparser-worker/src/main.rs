//! Video parser worker binary.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vparser_queue::{AmqpBroker, Broker, Publisher, QueueConfig, Topology, TopologyManager};
use vparser_store::{PgJobStore, StoreConfig};
use vparser_worker::{JobExecutor, MarkProcessedProcessor, WorkerConfig};

const DEFAULT_LOG_FILTER: &str = "vparser_worker=info,vparser_queue=info,vparser_store=info";

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Colored output for dev, JSON for production.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    // Required for rustls 0.23+ (AMQPS and Postgres TLS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    info!("Starting vparser-worker");

    let config = WorkerConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let store_config = StoreConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Prometheus metrics listening on port {}", port);
    }

    // Schema is owned by the API, which migrates before serving.
    let pg = PgJobStore::connect(&store_config)
        .await
        .context("Failed to connect to database")?;

    let broker: Arc<dyn Broker> = Arc::new(
        AmqpBroker::connect(&queue_config.rabbit_uri)
            .await
            .context("Failed to connect to broker")?,
    );
    TopologyManager::new(
        Arc::clone(&broker),
        Topology::video_parser(queue_config.retry_delay),
    )
    .declare()
    .await
    .context("Failed to declare broker topology")?;

    let publisher = Publisher::spawn(Arc::clone(&broker), queue_config.publish_buffer);
    let processor = Arc::new(MarkProcessedProcessor::new(Arc::new(pg.clone())));
    let executor = JobExecutor::new(
        config,
        Arc::clone(&broker),
        publisher.clone(),
        processor,
        queue_config.retry_policy(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = executor.run(shutdown_rx).await;

    publisher.shutdown().await;
    if let Err(e) = broker.close().await {
        warn!("Failed to close broker connection: {}", e);
    }
    pg.close().await;

    result.context("Executor error")?;
    info!("Worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal");
}
