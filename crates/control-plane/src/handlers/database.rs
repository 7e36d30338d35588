//! Database schema handler.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::db::init_schema;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Response for schema operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaOperationResponse {
    pub status: String,
    pub message: String,
}

/// Apply the flowrun schema.
///
/// POST /api/db/init
pub async fn init_database(State(state): State<AppState>) -> AppResult<Json<SchemaOperationResponse>> {
    let pool = state.db.as_ref().ok_or_else(|| {
        AppError::InvalidState("server is not backed by a database".to_string())
    })?;

    init_schema(pool).await?;

    Ok(Json(SchemaOperationResponse {
        status: "ok".to_string(),
        message: "Database schema initialized".to_string(),
    }))
}
