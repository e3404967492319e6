//! Crate-wide error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("boot timed out before the health check passed")]
    BootTimeout,

    #[error("container runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            OrchestratorError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            OrchestratorError::PermissionDenied => {
                (StatusCode::FORBIDDEN, "permission denied".to_string())
            }
            OrchestratorError::ResourceExhausted(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            OrchestratorError::UpstreamUnreachable(_) => (
                StatusCode::NOT_FOUND,
                "unable to reach service".to_string(),
            ),
            OrchestratorError::BootTimeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service did not become healthy in time".to_string(),
            ),
            OrchestratorError::Runtime(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            OrchestratorError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            OrchestratorError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
