use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::FlowStore;
use crate::db::models::{
    Execution, ExecutionPatch, ExecutionStep, Flow, FlowSummary, NewExecution, StepPatch,
};
use crate::engine::state::{ExecutionStatus, StepStatus};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct Tables {
    flows: HashMap<Uuid, Flow>,
    executions: HashMap<Uuid, Execution>,
    /// step id -> execution id
    step_owner: HashMap<Uuid, Uuid>,
}

/// [`FlowStore`] held in process memory.
///
/// Every write happens under one write lock, so counter updates are as
/// atomic as their SQL counterparts.
#[derive(Default)]
pub struct MemoryFlowStore {
    tables: RwLock<Tables>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a flow definition.
    pub async fn insert_flow(&self, flow: Flow) {
        self.tables.write().await.flows.insert(flow.id, flow);
    }

    /// Current state of a flow, including its counters.
    pub async fn flow(&self, flow_id: Uuid) -> Option<Flow> {
        self.tables.read().await.flows.get(&flow_id).cloned()
    }

    pub async fn execution_count(&self) -> usize {
        self.tables.read().await.executions.len()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn find_flow_with_nodes(&self, flow_id: Uuid, user_id: Uuid) -> AppResult<Option<Flow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .flows
            .get(&flow_id)
            .filter(|f| f.user_id == user_id)
            .cloned())
    }

    async fn find_flow_summary(&self, flow_id: Uuid) -> AppResult<Option<FlowSummary>> {
        let tables = self.tables.read().await;
        Ok(tables.flows.get(&flow_id).map(|f| FlowSummary {
            id: f.id,
            name: f.name.clone(),
        }))
    }

    async fn create_execution_with_steps(&self, new: NewExecution) -> AppResult<Execution> {
        let execution_id = Uuid::new_v4();
        let steps: Vec<ExecutionStep> = new
            .steps
            .into_iter()
            .map(|step| ExecutionStep {
                id: Uuid::new_v4(),
                execution_id,
                node_id: step.node.id.clone(),
                step_number: step.step_number,
                name: step.node.name.clone(),
                node: step.node,
                status: StepStatus::Pending,
                input: None,
                output: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                duration_ms: None,
            })
            .collect();

        let execution = Execution {
            id: execution_id,
            flow_id: new.flow_id,
            user_id: new.user_id,
            status: ExecutionStatus::Pending,
            trigger_data: new.trigger_data,
            output: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
            steps,
        };

        let mut tables = self.tables.write().await;
        if !tables.flows.contains_key(&execution.flow_id) {
            return Err(AppError::NotFound(format!("Flow {}", execution.flow_id)));
        }
        for step in &execution.steps {
            tables.step_owner.insert(step.id, execution_id);
        }
        tables.executions.insert(execution_id, execution.clone());

        Ok(execution)
    }

    async fn find_execution(&self, execution_id: Uuid) -> AppResult<Option<Execution>> {
        Ok(self.tables.read().await.executions.get(&execution_id).cloned())
    }

    async fn list_executions(
        &self,
        flow_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<Execution>> {
        let tables = self.tables.read().await;
        let mut executions: Vec<Execution> = tables
            .executions
            .values()
            .filter(|e| e.flow_id == flow_id && e.user_id == user_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }

    async fn update_execution(&self, execution_id: Uuid, patch: ExecutionPatch) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let execution = tables
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| AppError::NotFound(format!("Execution {}", execution_id)))?;
        patch.apply(execution);
        Ok(())
    }

    async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let not_found = || AppError::NotFound(format!("Execution step {}", step_id));

        let execution_id = *tables.step_owner.get(&step_id).ok_or_else(not_found)?;
        let step = tables
            .executions
            .get_mut(&execution_id)
            .and_then(|e| e.steps.iter_mut().find(|s| s.id == step_id))
            .ok_or_else(not_found)?;
        patch.apply(step);
        Ok(())
    }

    async fn increment_flow_counters(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let flow = tables
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| AppError::NotFound(format!("Flow {}", flow_id)))?;

        flow.total_runs += 1;
        if success {
            flow.successful_runs += 1;
        } else {
            flow.failed_runs += 1;
        }
        flow.last_run = flow.last_run.max(Some(at));
        Ok(())
    }

    async fn amend_flow_counters(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let flow = tables
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| AppError::NotFound(format!("Flow {}", flow_id)))?;

        if success {
            flow.successful_runs += 1;
            flow.failed_runs = (flow.failed_runs - 1).max(0);
        }
        flow.last_run = flow.last_run.max(Some(at));
        Ok(())
    }
}
