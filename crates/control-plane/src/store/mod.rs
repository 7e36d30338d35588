//! Flow store: where flows live and where execution records are persisted.
//!
//! The orchestrator and the query service only see [`FlowStore`].
//! [`PgFlowStore`] is the production implementation; [`MemoryFlowStore`]
//! backs tests and local runs without a database.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{Execution, ExecutionPatch, Flow, FlowSummary, NewExecution, StepPatch};
use crate::error::AppResult;

pub use memory::MemoryFlowStore;
pub use postgres::PgFlowStore;

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Flow with its nodes and edges, if it exists and belongs to `user_id`.
    async fn find_flow_with_nodes(&self, flow_id: Uuid, user_id: Uuid) -> AppResult<Option<Flow>>;

    async fn find_flow_summary(&self, flow_id: Uuid) -> AppResult<Option<FlowSummary>>;

    /// Create a PENDING execution and its PENDING steps atomically.
    async fn create_execution_with_steps(&self, new: NewExecution) -> AppResult<Execution>;

    /// Execution with steps ordered by `step_number`.
    async fn find_execution(&self, execution_id: Uuid) -> AppResult<Option<Execution>>;

    /// A flow's executions for `user_id`, most recent first, at most `limit`.
    async fn list_executions(
        &self,
        flow_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<Execution>>;

    /// `NotFound` if the execution does not exist.
    async fn update_execution(&self, execution_id: Uuid, patch: ExecutionPatch) -> AppResult<()>;

    /// `NotFound` if the step does not exist.
    async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> AppResult<()>;

    /// Atomically count a finished run and move `last_run` forward to `at`.
    async fn increment_flow_counters(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Re-count a run previously counted as failed. Leaves `total_runs` alone.
    async fn amend_flow_counters(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()>;
}
