//! Job handlers.
//!
//! A handler turns one delivered job into an outcome the worker can settle
//! the job with: success, a failure (retryable or not), or cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use flowrun_control_plane::engine::{ExecutionJob, ExecutionOrchestrator, RunOutcome};
use flowrun_control_plane::queue::Job;
use flowrun_control_plane::AppError;

/// Why a job did not succeed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload is not what this handler expects. Never retried.
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Execution(#[from] AppError),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Payload(_) => false,
            HandlerError::Execution(err) => err.is_retryable(),
        }
    }

    /// Interrupted by shutdown; the job should go back untouched.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Execution(AppError::Cancelled))
    }
}

/// Processes delivered jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<(), HandlerError>;
}

/// Runs `execute-flow` jobs through the orchestrator.
pub struct ExecutionJobHandler {
    orchestrator: Arc<ExecutionOrchestrator>,
}

impl ExecutionJobHandler {
    pub fn new(orchestrator: Arc<ExecutionOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for ExecutionJobHandler {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<(), HandlerError> {
        let payload: ExecutionJob = serde_json::from_value(job.payload.clone())?;

        let outcome = self.orchestrator.run_execution(&payload, cancel).await?;
        match outcome {
            RunOutcome::Finished(status) => tracing::info!(
                job_id = %job.id,
                execution_id = %payload.execution_id,
                status = %status,
                attempt = job.attempt(),
                "Execution job done"
            ),
            RunOutcome::AlreadyFinished(status) => tracing::debug!(
                job_id = %job.id,
                execution_id = %payload.execution_id,
                status = %status,
                "Duplicate execution job"
            ),
        }
        Ok(())
    }
}
