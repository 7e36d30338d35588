//! Health check endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::db::health_check as db_health_check;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database does not answer
    pub status: String,

    /// Database connectivity, omitted on the in-memory store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    pub uptime_seconds: u64,

    pub version: String,
}

/// `GET /health`
///
/// Always answers 200 while the process is up, so it can back a liveness
/// probe; `status` reports whether dependencies respond.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match &state.db {
        Some(pool) => Some(if db_health_check(pool).await {
            "ok".to_string()
        } else {
            "unreachable".to_string()
        }),
        None => None,
    };

    let status = match database.as_deref() {
        Some("unreachable") => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status: status.to_string(),
        database,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
