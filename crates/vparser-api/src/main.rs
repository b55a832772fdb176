//! Video parser API server binary.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vparser_api::{create_router, metrics, ApiConfig, ApiKeyRegistry, AppState, OutboxRelay};
use vparser_queue::{AmqpBroker, Broker, Publisher, QueueConfig, Topology, TopologyManager};
use vparser_store::{JobStore, PgJobStore, StoreConfig};

const DEFAULT_LOG_FILTER: &str = "vparser_api=info,vparser_queue=info,vparser_store=info";

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    if let Err(e) = run().await {
        error!("API server failed: {:#}", e);
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

    info!("Starting vparser-api");

    let config = ApiConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let store_config = StoreConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    let api_keys = ApiKeyRegistry::from_config(&config)
        .await
        .context("Failed to load API keys")?;

    let pg = PgJobStore::connect(&store_config)
        .await
        .context("Failed to connect to database")?;
    pg.run_migrations()
        .await
        .context("Failed to apply database migrations")?;
    let store: Arc<dyn JobStore> = Arc::new(pg.clone());

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

    let metrics_enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);
    let metrics_handle = if metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("Failed to install Prometheus recorder")?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = OutboxRelay::new(Arc::clone(&store), publisher.clone(), &config);
    let relay_handle = tokio::spawn(relay.run(shutdown_rx.clone()));

    let state = AppState::new(
        config.clone(),
        store,
        Arc::clone(&broker),
        publisher.clone(),
        api_keys,
    );
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()))
    .into_future();

    let grace = config.shutdown_grace;
    let deadline = async {
        wait_for_shutdown(shutdown_rx.clone()).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result.context("Server error")?,
        _ = deadline => warn!("In-flight requests still running after {:?}, closing", grace),
    }

    info!("Stopping background tasks");
    if let Err(e) = relay_handle.await {
        warn!("Outbox relay ended abnormally: {}", e);
    }
    publisher.shutdown().await;
    if let Err(e) = broker.close().await {
        warn!("Failed to close broker connection: {}", e);
    }
    pg.close().await;

    info!("Server shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // An Err means the sender is gone, which only happens after shutdown was sent.
    let _ = rx.wait_for(|stop| *stop).await;
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
