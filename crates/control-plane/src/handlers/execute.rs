//! Execution request handler.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::auth::CurrentUser;
use crate::db::models::Execution;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Body of an execution request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Data the trigger fired with; seeds the run's data.
    #[serde(default)]
    pub trigger_data: Option<Map<String, Value>>,
}

/// Request an execution of a flow.
///
/// POST /api/flows/{flow_id}/execute
///
/// Creates the execution and its steps, enqueues the run and answers
/// `202 Accepted` with the PENDING execution. An empty body means no
/// trigger data.
pub async fn execute(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(flow_id): Path<Uuid>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<Execution>)> {
    let request: ExecuteRequest = if body.is_empty() {
        ExecuteRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("Invalid request body: {}", e)))?
    };

    let execution = state
        .orchestrator
        .request_execution(flow_id, user_id, request.trigger_data)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(execution)))
}
