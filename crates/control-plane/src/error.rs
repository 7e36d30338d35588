//! Error types for the flowrun Control Plane.
//!
//! `AppError` is shared by the orchestrator, the stores, the query service
//! and the HTTP handlers. It implements `IntoResponse` so handlers can return
//! it directly, and `is_retryable` tells the worker whether a failed job
//! should go back to the queue.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::queue::QueueError;

/// Application-level errors for the control plane.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing flow or execution, or one owned by another user
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the current state (inactive flow, retry of a
    /// non-failed execution, illegal status transition)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Flow graph failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Node type outside the supported set
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// Node raised while executing
    #[error("{0}")]
    NodeExecution(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job queue / broker error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller identity missing or malformed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Run interrupted by shutdown
    #[error("Execution cancelled")]
    Cancelled,

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure is transient infrastructure trouble that a
    /// whole-job retry may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Queue(_) | AppError::Internal(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::InvalidState(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::UnknownNodeType(_) | AppError::NodeExecution(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Queue(e) => {
                tracing::error!(error = %e, "Queue error");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("Flow not found".to_string());
        assert_eq!(err.to_string(), "Resource not found: Flow not found");
    }

    #[test]
    fn test_node_execution_message_is_verbatim() {
        let err = AppError::NodeExecution("boom".to_string());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_retry_classification() {
        assert!(AppError::Internal("disk".into()).is_retryable());
        assert!(AppError::Queue(QueueError::Broker("down".into())).is_retryable());
        assert!(!AppError::NotFound("x".into()).is_retryable());
        assert!(!AppError::InvalidState("x".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let resp = AppError::InvalidState("inactive".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = AppError::Auth("missing".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
