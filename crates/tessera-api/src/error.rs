// API error envelope
//
// Every error response carries `{"detail": "..."}` with one of the reserved
// status codes: 400 validation, 401 auth, 404 unknown id, 409 duplicate or
// closed workflow, 429 capacity, 503 orchestrator unreachable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use tessera_durable::{ExecutorError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, "request failed: {self}");
        }
        (status, Json(json!({"detail": self.to_string()}))).into_response()
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Store(StoreError::AlreadyStarted(id)) => {
                Self::Conflict(format!("workflow already started: {id}"))
            }
            ExecutorError::Store(StoreError::ChannelFull(id)) => {
                Self::RateLimited(format!("signal channel full for workflow {id}"))
            }
            ExecutorError::Store(StoreError::Database(msg)) => {
                Self::Unavailable(format!("orchestrator store unavailable: {msg}"))
            }
            ExecutorError::WorkflowNotFound(id) => Self::NotFound(format!("unknown workflow: {id}")),
            ExecutorError::WorkflowClosed(id) => {
                Self::Conflict(format!("workflow {id} is closed"))
            }
            ExecutorError::InputTooLarge(bytes) => {
                Self::Validation(format!("input too large: {bytes} bytes"))
            }
            ExecutorError::UnknownQuery(name) => Self::Validation(format!("unknown query: {name}")),
            ExecutorError::Registry(e) => Self::Validation(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::from(ExecutorError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::RateLimited("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_executor_error_mapping() {
        let conflict: ApiError =
            ExecutorError::Store(StoreError::AlreadyStarted("d1".into())).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let missing: ApiError = ExecutorError::WorkflowNotFound("d1".into()).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let full: ApiError = ExecutorError::Store(StoreError::ChannelFull("d1".into())).into();
        assert_eq!(full.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
