//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use nodeflow_types::error::{EngineError, RepositoryError};

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    /// Malformed request input.
    Validation(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Engine(EngineError::Validation(e)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            AppError::Engine(EngineError::NodeNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "NODE_NOT_FOUND",
                format!("Node execution {id} not found"),
            ),
            AppError::Engine(EngineError::CallbackNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "CALLBACK_NOT_FOUND",
                format!("No node is waiting on callback '{id}'"),
            ),
            AppError::Engine(EngineError::Repository(RepositoryError::NotFound)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "Entity not found".to_string())
            }
            AppError::Engine(EngineError::Repository(RepositoryError::Conflict(msg))) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone())
            }
            AppError::Engine(EngineError::Executor(msg)) => {
                (StatusCode::BAD_GATEWAY, "EXECUTOR_ERROR", msg.clone())
            }
            AppError::Engine(EngineError::Upstream(msg)) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone())
            }
            AppError::Engine(e) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }
        (status, Json(ApiResponse::error(code, &message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_types::error::ValidationError;

    #[test]
    fn engine_errors_map_to_status_codes() {
        let cases = [
            (
                AppError::from(EngineError::Validation(ValidationError::EmptyProjection)),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(EngineError::CallbackNotFound("cb".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(EngineError::Repository(RepositoryError::Conflict("x".into()))),
                StatusCode::CONFLICT,
            ),
            (
                AppError::from(EngineError::Repository(RepositoryError::Query("boom".into()))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::Validation("bad".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
