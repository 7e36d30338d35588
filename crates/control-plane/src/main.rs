//! flowrun Control Plane Server
//!
//! Accepts execution requests and serves execution queries. Runs are
//! enqueued on NATS JetStream and executed by `flowrun-worker`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowrun_control_plane::{
    build_router,
    config::{AppConfig, DatabaseConfig, QueueConfig},
    db::create_pool,
    engine::{DefaultNodeExecutor, ExecutionOrchestrator, OrchestratorSettings},
    queue::NatsJobQueue,
    state::AppState,
    store::PgFlowStore,
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,flowrun_control_plane=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env().unwrap_or_default();
    init_tracing(app_config.json_logs());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting flowrun Control Plane"
    );

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });
    let queue_config = QueueConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load queue config, using defaults");
        QueueConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        debug = app_config.debug,
        queue = %queue_config.name,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    let queue = Arc::new(NatsJobQueue::connect(&queue_config).await?);

    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        Arc::new(PgFlowStore::new(db_pool.clone())),
        queue.clone(),
        Arc::new(DefaultNodeExecutor::new()),
        OrchestratorSettings::from(&queue_config),
    ));

    let state = AppState::new(app_config.clone(), orchestrator, queue, Some(db_pool));
    let app = build_router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
