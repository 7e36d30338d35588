//! Execution query service.
//!
//! Read access to executions scoped to their owner, plus retry of a failed
//! execution as a brand new one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::{Execution, FlowSummary};
use crate::engine::{ExecutionOrchestrator, ExecutionStatus};
use crate::error::{AppError, AppResult};
use crate::store::FlowStore;

/// Executions returned by [`ExecutionService::list_logs`] when no limit is given.
pub const DEFAULT_LOG_LIMIT: i64 = 50;

/// Upper bound for a requested list limit.
pub const MAX_LOG_LIMIT: i64 = 100;

/// An execution with its steps and the flow it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub flow: FlowSummary,
}

/// Execution query service.
#[derive(Clone)]
pub struct ExecutionService {
    store: Arc<dyn FlowStore>,
    orchestrator: Arc<ExecutionOrchestrator>,
}

impl ExecutionService {
    pub fn new(store: Arc<dyn FlowStore>, orchestrator: Arc<ExecutionOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Get an execution owned by `user_id`, with its steps and flow.
    pub async fn get(&self, execution_id: Uuid, user_id: Uuid) -> AppResult<ExecutionDetail> {
        let execution = self.find_owned(execution_id, user_id).await?;
        let flow = self
            .store
            .find_flow_summary(execution.flow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Flow {}", execution.flow_id)))?;

        Ok(ExecutionDetail { execution, flow })
    }

    /// Most recent executions of a flow, newest first.
    ///
    /// `limit` defaults to [`DEFAULT_LOG_LIMIT`] and is clamped to
    /// `1..=MAX_LOG_LIMIT`.
    pub async fn list_logs(
        &self,
        flow_id: Uuid,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> AppResult<Vec<Execution>> {
        let limit = clamp_limit(limit);
        self.store.list_executions(flow_id, user_id, limit).await
    }

    /// Start a new execution of a FAILED execution's flow with the same
    /// trigger data. The failed execution is left as it is.
    pub async fn retry(&self, execution_id: Uuid, user_id: Uuid) -> AppResult<Execution> {
        let original = self.find_owned(execution_id, user_id).await?;

        if original.status != ExecutionStatus::Failed {
            return Err(AppError::InvalidState(format!(
                "Execution {} is {}, only FAILED executions can be retried",
                execution_id, original.status
            )));
        }

        let retried = self
            .orchestrator
            .request_execution(original.flow_id, user_id, Some(original.trigger_data))
            .await?;

        tracing::info!(
            execution_id = %execution_id,
            new_execution_id = %retried.id,
            "Execution retried"
        );
        Ok(retried)
    }

    async fn find_owned(&self, execution_id: Uuid, user_id: Uuid) -> AppResult<Execution> {
        self.store
            .find_execution(execution_id)
            .await?
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("Execution {}", execution_id)))
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT)
}
