//! Flow queries.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{Flow, FlowRow, FlowSummary};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};

const FLOW_COLUMNS: &str = r#"
    id, user_id, name, description, is_active, trigger_type, version,
    nodes, edges, total_runs, successful_runs, failed_runs, last_run,
    created_at, updated_at
"#;

/// Get a flow with its nodes and edges, scoped to its owner.
pub async fn get_flow(pool: &DbPool, flow_id: Uuid, user_id: Uuid) -> AppResult<Option<Flow>> {
    let row = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {} FROM flowrun.flow WHERE id = $1 AND user_id = $2",
        FLOW_COLUMNS
    ))
    .bind(flow_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(Flow::try_from).transpose()
}

/// Get the `{id, name}` of a flow.
pub async fn get_flow_summary(pool: &DbPool, flow_id: Uuid) -> AppResult<Option<FlowSummary>> {
    let summary = sqlx::query_as::<_, FlowSummary>(
        r#"
        SELECT id, name
        FROM flowrun.flow
        WHERE id = $1
        "#,
    )
    .bind(flow_id)
    .fetch_optional(pool)
    .await?;

    Ok(summary)
}

/// Count one finished run.
///
/// Single statement, so concurrent finishers never lose an update.
/// `last_run` only moves forward.
pub async fn increment_counters(
    pool: &DbPool,
    flow_id: Uuid,
    success: bool,
    at: DateTime<Utc>,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE flowrun.flow
        SET total_runs = total_runs + 1,
            successful_runs = successful_runs + CASE WHEN $2 THEN 1 ELSE 0 END,
            failed_runs = failed_runs + CASE WHEN $2 THEN 0 ELSE 1 END,
            last_run = GREATEST(last_run, $3)
        WHERE id = $1
        "#,
    )
    .bind(flow_id)
    .bind(success)
    .bind(at)
    .execute(pool)
    .await?;

    ensure_flow_updated(result.rows_affected(), flow_id)
}

/// Re-count a run that was already counted as failed.
///
/// On success the run moves from `failed_runs` to `successful_runs`;
/// `total_runs` is untouched either way.
pub async fn amend_counters(
    pool: &DbPool,
    flow_id: Uuid,
    success: bool,
    at: DateTime<Utc>,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE flowrun.flow
        SET successful_runs = successful_runs + CASE WHEN $2 THEN 1 ELSE 0 END,
            failed_runs = GREATEST(failed_runs - CASE WHEN $2 THEN 1 ELSE 0 END, 0),
            last_run = GREATEST(last_run, $3)
        WHERE id = $1
        "#,
    )
    .bind(flow_id)
    .bind(success)
    .bind(at)
    .execute(pool)
    .await?;

    ensure_flow_updated(result.rows_affected(), flow_id)
}

fn ensure_flow_updated(rows: u64, flow_id: Uuid) -> AppResult<()> {
    if rows == 0 {
        return Err(AppError::NotFound(format!("Flow {}", flow_id)));
    }
    Ok(())
}
