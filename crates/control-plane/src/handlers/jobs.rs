//! Job inspection handler.

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use super::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::queue::Job;
use crate::state::AppState;

/// GET /api/jobs/{job_id}
///
/// Job record from the execution queue. Jobs whose payload names another
/// user are reported as missing.
pub async fn get(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> AppResult<Json<Job>> {
    state
        .queue
        .get_job(state.queue_name(), &job_id)
        .await?
        .filter(|job| owner(job) == Some(user))
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))
}

fn owner(job: &Job) -> Option<Uuid> {
    job.payload
        .get("userId")
        .and_then(|v| v.as_str())
        .and_then(|v| Uuid::parse_str(v).ok())
}
