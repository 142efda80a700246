//! Error kinds shared across the pipeline (spec §7).
//!
//! Model-client and vector-store failures bubble up as [`PipelineError`] so
//! call sites can match on kind instead of string-sniffing an `anyhow::Error`.
//! Everything else stays on `anyhow::Result` with `.context(...)`, matching
//! the rest of the codebase.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    #[error("backend protocol error: {0}")]
    BackendProtocolError(String),

    #[error("tool error: {0}")]
    ToolError(String),

    #[error("iteration budget exceeded")]
    IterationBudgetExceeded,

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

impl PipelineError {
    /// Name as it appears in the `error` SSE event's optional `kind` field.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            PipelineError::BackendUnavailable(_) => "BackendUnavailable",
            PipelineError::BackendTimeout(_) => "BackendTimeout",
            PipelineError::BackendProtocolError(_) => "BackendProtocolError",
            PipelineError::ToolError(_) => "ToolError",
            PipelineError::IterationBudgetExceeded => "IterationBudgetExceeded",
            PipelineError::PersistenceError(_) => "PersistenceError",
            PipelineError::ValidationError(_) => "ValidationError",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Only `ValidationError` is ever surfaced as a plain HTTP response: every
/// other kind is reported through the SSE stream itself (spec §7).
impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match self {
            PipelineError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
