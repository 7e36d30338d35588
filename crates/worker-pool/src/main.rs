//! flowrun Worker Pool binary.
//!
//! Runs a worker that pulls execution jobs from NATS JetStream and drives
//! them to completion against Postgres.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowrun_control_plane::{
    config::DatabaseConfig,
    db::create_pool,
    engine::{DefaultNodeExecutor, ExecutionOrchestrator, OrchestratorSettings},
    queue::NatsJobQueue,
    store::PgFlowStore,
};
use flowrun_worker::{ExecutionJobHandler, Worker, WorkerConfig};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,flowrun_worker=debug,flowrun_control_plane=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_id = %config.worker_id,
        queue = %config.queue.name,
        concurrency = config.concurrency,
        "Starting flowrun Worker Pool"
    );

    let db_config = DatabaseConfig::from_env()?;
    let pool = create_pool(&db_config).await?;
    let queue = Arc::new(NatsJobQueue::connect(&config.queue).await?);

    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        Arc::new(PgFlowStore::new(pool)),
        queue.clone(),
        Arc::new(DefaultNodeExecutor::new()),
        OrchestratorSettings::from(&config.queue),
    ));
    let handler = Arc::new(ExecutionJobHandler::new(orchestrator));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let worker = Worker::new(config, queue, handler);
    if let Err(e) = worker.run(shutdown).await {
        tracing::error!(error = %e, "Worker error");
        return Err(e);
    }

    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, draining in-flight jobs");
    shutdown.cancel();
}
