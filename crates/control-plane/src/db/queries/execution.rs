//! Execution and execution-step queries.

use std::collections::HashMap;

use sqlx::types::Json;
use uuid::Uuid;

use crate::db::models::{
    Execution, ExecutionPatch, ExecutionRow, ExecutionStep, NewExecution, StepPatch, StepRow,
};
use crate::db::DbPool;
use crate::engine::state::{ExecutionStatus, StepStatus};
use crate::error::{AppError, AppResult};

const EXECUTION_COLUMNS: &str = r#"
    id, flow_id, user_id, status, trigger_data, output, error_message,
    started_at, completed_at, duration_ms, created_at
"#;

const STEP_COLUMNS: &str = r#"
    id, execution_id, node_id, step_number, name, node, status, input, output,
    error_message, started_at, completed_at, duration_ms
"#;

/// Insert an execution and all of its steps in one transaction.
pub async fn insert_execution_with_steps(
    pool: &DbPool,
    new: NewExecution,
) -> AppResult<Execution> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        INSERT INTO flowrun.execution (id, flow_id, user_id, status, trigger_data)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        EXECUTION_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(new.flow_id)
    .bind(new.user_id)
    .bind(ExecutionStatus::Pending.as_str())
    .bind(Json(&new.trigger_data))
    .fetch_one(&mut *tx)
    .await?;

    let mut steps = Vec::with_capacity(new.steps.len());
    for step in &new.steps {
        let step_row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO flowrun.execution_step
                (id, execution_id, node_id, step_number, name, node, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            STEP_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(row.id)
        .bind(&step.node.id)
        .bind(step.step_number)
        .bind(&step.node.name)
        .bind(Json(&step.node))
        .bind(StepStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?;
        steps.push(ExecutionStep::try_from(step_row)?);
    }

    tx.commit().await?;

    row.into_execution(steps)
}

/// Get an execution with its steps ordered by step number.
pub async fn get_execution(pool: &DbPool, execution_id: Uuid) -> AppResult<Option<Execution>> {
    let row = sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {} FROM flowrun.execution WHERE id = $1",
        EXECUTION_COLUMNS
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let steps = sqlx::query_as::<_, StepRow>(&format!(
        "SELECT {} FROM flowrun.execution_step WHERE execution_id = $1 ORDER BY step_number",
        STEP_COLUMNS
    ))
    .bind(execution_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(ExecutionStep::try_from)
    .collect::<AppResult<Vec<_>>>()?;

    row.into_execution(steps).map(Some)
}

/// List a flow's executions, most recent first, each with its steps.
pub async fn list_executions(
    pool: &DbPool,
    flow_id: Uuid,
    user_id: Uuid,
    limit: i64,
) -> AppResult<Vec<Execution>> {
    let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
        r#"
        SELECT {}
        FROM flowrun.execution
        WHERE flow_id = $1 AND user_id = $2
        ORDER BY created_at DESC
        LIMIT $3
        "#,
        EXECUTION_COLUMNS
    ))
    .bind(flow_id)
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let step_rows = sqlx::query_as::<_, StepRow>(&format!(
        r#"
        SELECT {}
        FROM flowrun.execution_step
        WHERE execution_id = ANY($1)
        ORDER BY execution_id, step_number
        "#,
        STEP_COLUMNS
    ))
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let mut steps_by_execution: HashMap<Uuid, Vec<ExecutionStep>> = HashMap::new();
    for step_row in step_rows {
        let step = ExecutionStep::try_from(step_row)?;
        steps_by_execution
            .entry(step.execution_id)
            .or_default()
            .push(step);
    }

    rows.into_iter()
        .map(|row| {
            let steps = steps_by_execution.remove(&row.id).unwrap_or_default();
            row.into_execution(steps)
        })
        .collect()
}

/// Apply a partial update to an execution.
pub async fn update_execution(
    pool: &DbPool,
    execution_id: Uuid,
    patch: ExecutionPatch,
) -> AppResult<()> {
    let (set_error, error_message) = match patch.error_message {
        Some(message) => (true, message),
        None => (false, None),
    };

    let result = sqlx::query(
        r#"
        UPDATE flowrun.execution
        SET status = COALESCE($2, status),
            output = COALESCE($3, output),
            error_message = CASE WHEN $4 THEN $5 ELSE error_message END,
            started_at = COALESCE($6, started_at),
            completed_at = COALESCE($7, completed_at),
            duration_ms = COALESCE($8, duration_ms)
        WHERE id = $1
        "#,
    )
    .bind(execution_id)
    .bind(patch.status.map(|s| s.as_str()))
    .bind(patch.output)
    .bind(set_error)
    .bind(error_message)
    .bind(patch.started_at)
    .bind(patch.completed_at)
    .bind(patch.duration_ms)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Execution {}", execution_id)));
    }
    Ok(())
}

/// Apply a partial update to a step.
pub async fn update_step(pool: &DbPool, step_id: Uuid, patch: StepPatch) -> AppResult<()> {
    let (set_error, error_message) = match patch.error_message {
        Some(message) => (true, message),
        None => (false, None),
    };

    let result = sqlx::query(
        r#"
        UPDATE flowrun.execution_step
        SET status = COALESCE($2, status),
            input = COALESCE($3, input),
            output = COALESCE($4, output),
            error_message = CASE WHEN $5 THEN $6 ELSE error_message END,
            started_at = COALESCE($7, started_at),
            completed_at = COALESCE($8, completed_at),
            duration_ms = COALESCE($9, duration_ms)
        WHERE id = $1
        "#,
    )
    .bind(step_id)
    .bind(patch.status.map(|s| s.as_str()))
    .bind(patch.input)
    .bind(patch.output)
    .bind(set_error)
    .bind(error_message)
    .bind(patch.started_at)
    .bind(patch.completed_at)
    .bind(patch.duration_ms)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Execution step {}", step_id)));
    }
    Ok(())
}
