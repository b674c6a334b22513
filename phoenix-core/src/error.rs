//! Error taxonomy for the control plane.
//!
//! Mirrors the teacher crate's `RegistryError`: one flat `thiserror` enum,
//! plus an HTTP mapping so handlers can return `Result<T, PhoenixError>`
//! directly and get the `{error:{code,message}}` envelope for free.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PhoenixError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PhoenixError {
    /// Malformed input, referenced template missing, unknown target hosts.
    #[error("validation error: {0}")]
    Validation(String),

    /// Phase precondition failed, task status regression, duplicate deployment.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing/invalid agent identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Store deadlock, backend query timeout — retried internally with
    /// bounded back-off by the caller before this variant is surfaced.
    #[error("temporarily unavailable: {0}")]
    UnavailableTransient(String),

    /// Invariant violation, migration mismatch.
    #[error("internal error: {0}")]
    FatalInternal(String),

    #[error("template error: {0}")]
    Template(#[from] crate::templates::TemplateError),

    #[error("analyzer error: {0}")]
    Analyzer(#[from] crate::analyzer::AnalyzerError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PhoenixError {
    pub fn code(&self) -> &'static str {
        match self {
            PhoenixError::Validation(_) => "VALIDATION_FAILED",
            PhoenixError::Conflict(_) => "CONFLICT",
            PhoenixError::NotFound(_) => "NOT_FOUND",
            PhoenixError::Unauthorized(_) => "UNAUTHORIZED",
            PhoenixError::UnavailableTransient(_) => "UNAVAILABLE",
            PhoenixError::FatalInternal(_) => "INTERNAL_ERROR",
            PhoenixError::Template(_) => "TEMPLATE_ERROR",
            PhoenixError::Analyzer(_) => "ANALYZER_ERROR",
            PhoenixError::Serialization(_) => "SERIALIZATION_ERROR",
            PhoenixError::Io(_) => "IO_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PhoenixError::Validation(_) => StatusCode::BAD_REQUEST,
            PhoenixError::Conflict(_) => StatusCode::CONFLICT,
            PhoenixError::NotFound(_) => StatusCode::NOT_FOUND,
            PhoenixError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PhoenixError::UnavailableTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            PhoenixError::Template(_) => StatusCode::BAD_REQUEST,
            PhoenixError::Analyzer(crate::analyzer::AnalyzerError::InsufficientDataWindow) => {
                StatusCode::OK
            }
            PhoenixError::Analyzer(_) => StatusCode::SERVICE_UNAVAILABLE,
            PhoenixError::FatalInternal(_) | PhoenixError::Serialization(_) | PhoenixError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// The wire envelope: `{error: {code, message, details?}}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for PhoenixError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, code = self.code(), "request failed");
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_each_error_kind() {
        assert_eq!(PhoenixError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(PhoenixError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(PhoenixError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(PhoenixError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            PhoenixError::UnavailableTransient("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
