use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Registry-level errors surfaced to the framework integration layer.
///
/// Failures on the recording path never take this form: they degrade to
/// dropped-event and invariant-violation counters instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfilerError {
    /// `begin` was called for a correlation id that is still live
    #[error("Duplicate context: {0}")]
    DuplicateContext(String),
    /// No active context for the correlation id
    #[error("Context not found: {0}")]
    NotFound(String),
    /// Another caller is already finalizing this context
    #[error("Context already finalizing: {0}")]
    AlreadyFinalizing(String),
    /// Malformed internal state (e.g. a span parent from another request)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    /// Profiling is switched off
    #[error("Profiler disabled")]
    Disabled,
}

/// Errors returned by the dashboard HTTP API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Persistence unavailable")]
    StoreUnavailable,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

fn error_type_name(error: &ApiError) -> &'static str {
    match error {
        ApiError::NotFound(_) => "not_found",
        ApiError::BadRequest(_) => "bad_request",
        ApiError::StoreUnavailable => "store_unavailable",
        ApiError::Internal(_) => "internal_error",
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}
