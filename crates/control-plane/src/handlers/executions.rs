//! Execution query handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::auth::CurrentUser;
use crate::db::models::Execution;
use crate::error::AppResult;
use crate::services::ExecutionDetail;
use crate::state::AppState;

/// Query parameters for listing a flow's executions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// GET /api/flows/{flow_id}/executions
pub async fn list(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(flow_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Execution>>> {
    let executions = state
        .executions
        .list_logs(flow_id, user_id, query.limit)
        .await?;
    Ok(Json(executions))
}

/// GET /api/executions/{execution_id}
pub async fn get(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(execution_id): Path<Uuid>,
) -> AppResult<Json<ExecutionDetail>> {
    let detail = state.executions.get(execution_id, user_id).await?;
    Ok(Json(detail))
}

/// POST /api/executions/{execution_id}/retry
///
/// Only FAILED executions can be retried; the retry is a new execution.
pub async fn retry(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(execution_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<Execution>)> {
    let execution = state.executions.retry(execution_id, user_id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}
