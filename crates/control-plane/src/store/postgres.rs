use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::FlowStore;
use crate::db::models::{Execution, ExecutionPatch, Flow, FlowSummary, NewExecution, StepPatch};
use crate::db::queries::{execution, flow};
use crate::db::DbPool;
use crate::error::AppResult;

/// [`FlowStore`] over the `flowrun` Postgres schema.
#[derive(Clone)]
pub struct PgFlowStore {
    pool: DbPool,
}

impl PgFlowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl FlowStore for PgFlowStore {
    async fn find_flow_with_nodes(&self, flow_id: Uuid, user_id: Uuid) -> AppResult<Option<Flow>> {
        flow::get_flow(&self.pool, flow_id, user_id).await
    }

    async fn find_flow_summary(&self, flow_id: Uuid) -> AppResult<Option<FlowSummary>> {
        flow::get_flow_summary(&self.pool, flow_id).await
    }

    async fn create_execution_with_steps(&self, new: NewExecution) -> AppResult<Execution> {
        execution::insert_execution_with_steps(&self.pool, new).await
    }

    async fn find_execution(&self, execution_id: Uuid) -> AppResult<Option<Execution>> {
        execution::get_execution(&self.pool, execution_id).await
    }

    async fn list_executions(
        &self,
        flow_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<Execution>> {
        execution::list_executions(&self.pool, flow_id, user_id, limit).await
    }

    async fn update_execution(&self, execution_id: Uuid, patch: ExecutionPatch) -> AppResult<()> {
        execution::update_execution(&self.pool, execution_id, patch).await
    }

    async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> AppResult<()> {
        execution::update_step(&self.pool, step_id, patch).await
    }

    async fn increment_flow_counters(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        flow::increment_counters(&self.pool, flow_id, success, at).await
    }

    async fn amend_flow_counters(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        flow::amend_counters(&self.pool, flow_id, success, at).await
    }
}
