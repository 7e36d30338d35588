//! Application state for the flowrun Control Plane server.
//!
//! Shared by every handler through Axum's state management. Cloning is
//! cheap: everything behind it is reference counted.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::engine::ExecutionOrchestrator;
use crate::queue::JobQueue;
use crate::services::ExecutionService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Requests executions
    pub orchestrator: Arc<ExecutionOrchestrator>,

    /// Reads and retries executions
    pub executions: ExecutionService,

    /// Job queue runs are enqueued on
    pub queue: Arc<dyn JobQueue>,

    /// Database pool, absent when running on the in-memory store
    pub db: Option<DbPool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        orchestrator: Arc<ExecutionOrchestrator>,
        queue: Arc<dyn JobQueue>,
        db: Option<DbPool>,
    ) -> Self {
        let executions = ExecutionService::new(orchestrator.store().clone(), orchestrator.clone());
        Self {
            config: Arc::new(config),
            orchestrator,
            executions,
            queue,
            db,
            start_time: std::time::Instant::now(),
        }
    }

    /// Queue execution jobs are published to.
    pub fn queue_name(&self) -> &str {
        &self.orchestrator.settings().queue_name
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
