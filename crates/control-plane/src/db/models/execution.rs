//! Execution and execution-step models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::flow::FlowNode;
use crate::engine::state::{ExecutionStatus, StepStatus};
use crate::error::AppError;

/// One run of a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub user_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_data: Map<String, Value>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Ordered by `step_number`.
    pub steps: Vec<ExecutionStep>,
}

impl Execution {
    pub fn failed_step(&self) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

/// One node's run within an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub step_number: i32,
    pub name: String,
    /// Node definition as it was when the execution was requested.
    pub node: FlowNode,
    pub status: StepStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Step to create alongside a new execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub step_number: i32,
    pub node: FlowNode,
}

/// Execution to create, with its planned steps.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub flow_id: Uuid,
    pub user_id: Uuid,
    pub trigger_data: Map<String, Value>,
    pub steps: Vec<NewStep>,
}

/// Partial update of an execution. `None` leaves a column unchanged;
/// `error_message: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub output: Option<Value>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl ExecutionPatch {
    pub fn apply(self, execution: &mut Execution) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(output) = self.output {
            execution.output = Some(output);
        }
        if let Some(error_message) = self.error_message {
            execution.error_message = error_message;
        }
        if let Some(started_at) = self.started_at {
            execution.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            execution.completed_at = Some(completed_at);
        }
        if let Some(duration_ms) = self.duration_ms {
            execution.duration_ms = Some(duration_ms);
        }
    }
}

/// Partial update of a step, same conventions as [`ExecutionPatch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl StepPatch {
    pub fn apply(self, step: &mut ExecutionStep) {
        if let Some(status) = self.status {
            step.status = status;
        }
        if let Some(input) = self.input {
            step.input = Some(input);
        }
        if let Some(output) = self.output {
            step.output = Some(output);
        }
        if let Some(error_message) = self.error_message {
            step.error_message = error_message;
        }
        if let Some(started_at) = self.started_at {
            step.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            step.completed_at = Some(completed_at);
        }
        if let Some(duration_ms) = self.duration_ms {
            step.duration_ms = Some(duration_ms);
        }
    }
}

/// Row of `flowrun.execution`.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub trigger_data: Json<Map<String, Value>>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRow {
    pub fn into_execution(self, steps: Vec<ExecutionStep>) -> Result<Execution, AppError> {
        Ok(Execution {
            id: self.id,
            flow_id: self.flow_id,
            user_id: self.user_id,
            status: self.status.parse()?,
            trigger_data: self.trigger_data.0,
            output: self.output,
            error_message: self.error_message,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
            steps,
        })
    }
}

/// Row of `flowrun.execution_step`.
#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub step_number: i32,
    pub name: String,
    pub node: Json<FlowNode>,
    pub status: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TryFrom<StepRow> for ExecutionStep {
    type Error = AppError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(ExecutionStep {
            id: row.id,
            execution_id: row.execution_id,
            node_id: row.node_id,
            step_number: row.step_number,
            name: row.name,
            node: row.node.0,
            status: row.status.parse()?,
            input: row.input,
            output: row.output,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}
