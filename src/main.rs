//! Chronik Binary Entry Point
//!
//! This binary runs the complete edge historian: bus subscriber, storage
//! writer, retention sweeper, and the HTTP query API. Core functionality is
//! provided by the `chronik` library crate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use chronik::{
    BusSubscriber, RetentionSweeper, ServiceState, StorageBuilder,
    config::AppConfig,
    server::{AppState, create_router},
};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the bus and sweeper tasks after the stop signal.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Chronik - Edge Telemetry Historian
#[derive(Parser, Debug)]
#[command(name = "chronik", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/chronik.yaml",
        env = "CHRONIK_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "CHRONIK_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "CHRONIK_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database file path (overrides config file)
    #[arg(long, env = "CHRONIK_DB_PATH")]
    db_path: Option<String>,

    /// Bus host (overrides config file)
    #[arg(long, env = "CHRONIK_BUS_HOST")]
    bus_host: Option<String>,

    /// Bus port (overrides config file)
    #[arg(long, env = "CHRONIK_BUS_PORT")]
    bus_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments and load configuration. An unusable config is the
    // one permitted fatal startup error.
    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    if let Some(host) = cli.bus_host {
        config.bus.host = host;
    }
    if let Some(port) = cli.bus_port {
        config.bus.port = port;
    }
    config.validate()?;

    // Initialize tracing; RUST_LOG wins over the configured level.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Chronik - Edge Telemetry Historian");
    tracing::info!(
        "Server: {}:{}, Bus: {}:{}, Database: {}",
        config.server.bind,
        config.server.port,
        config.bus.host,
        config.bus.port,
        config.database.path,
    );

    // Shared counters and liveness flags, one instance for every component.
    let service = Arc::new(ServiceState::new());

    // Build storage layer
    tracing::info!("Initializing storage at: {}", config.database.path);
    let handles = StorageBuilder::new(&config.database.path)
        .pool_size(config.database.pool_size)
        .channel_capacity(config.database.channel_capacity)
        .batch_size(config.database.batch_size)
        .batch_flush_interval(config.database.batch_flush_interval)
        .checkpoint_interval(config.database.checkpoint_interval)
        .state(Arc::clone(&service))
        .build()?;
    tracing::info!("Storage initialized");

    // Start the bus subscriber and the retention sweeper.
    let (stop_tx, stop_rx) = watch::channel(false);

    let subscriber = BusSubscriber::new(
        config.bus.clone(),
        handles.writer.clone(),
        Arc::clone(&service),
    );
    let bus_task = subscriber.spawn(stop_rx.clone());

    let sweeper = RetentionSweeper::new(handles.admin.clone(), &config.retention);
    let sweep_task = sweeper.spawn(stop_rx);

    // Create web server state
    let app_state = AppState {
        reader: handles.reader.clone(),
        service: Arc::clone(&service),
        query: config.query,
        op_timeout: config.database.op_timeout,
    };
    let app = create_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    tracing::info!("Query API listening on: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight requests have completed; stop the background tasks, then
    // give the writer its grace period to flush the queue.
    tracing::info!("Stopping bus subscriber and sweeper...");
    let _ = stop_tx.send(true);
    for (name, task) in [("bus", bus_task), ("sweeper", sweep_task)] {
        if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
            tracing::warn!(task = name, "Task did not stop in time");
        }
    }

    tracing::info!("Shutting down storage...");
    if let Err(e) = handles.shutdown() {
        tracing::error!(error = %e, "Failed to shutdown storage");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
