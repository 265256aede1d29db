//! Typed errors and HTTP mapping.

use crate::compiler::Diagnostic;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the module runtime core. Each variant maps to one
/// stable error code on the wire.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("invalid module definition: {0}")]
    InvalidModuleDefinition(String),
    #[error("compilation failed with {} diagnostic(s)", .0.len())]
    CompilationFailed(Vec<Diagnostic>),
    #[error("service configuration: {0}")]
    ServiceConfigurationError(String),
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("service resolution: {0}")]
    ServiceResolutionError(String),
    #[error("query compilation failed with {} diagnostic(s)", .0.len())]
    QueryCompilationFailed(Vec<Diagnostic>),
    #[error("query execution: {0}")]
    QueryExecutionFailed(String),
    #[error("concurrent modification: {0}")]
    ConcurrentModificationConflict(String),
}

impl RuntimeError {
    /// Diagnostics attached to this error, if any. Rides in the error body's
    /// `details` field so callers can display source/line/message.
    pub fn diagnostics(&self) -> Option<&[Diagnostic]> {
        match self {
            RuntimeError::CompilationFailed(d) | RuntimeError::QueryCompilationFailed(d) => {
                Some(d)
            }
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn runtime_status(err: &RuntimeError) -> (StatusCode, &'static str) {
    match err {
        RuntimeError::InvalidModuleDefinition(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_module_definition")
        }
        RuntimeError::CompilationFailed(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "compilation_failed")
        }
        RuntimeError::ServiceConfigurationError(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "service_configuration_error")
        }
        RuntimeError::ModuleNotFound(_) => (StatusCode::NOT_FOUND, "module_not_found"),
        RuntimeError::ServiceResolutionError(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "service_resolution_error")
        }
        RuntimeError::QueryCompilationFailed(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "query_compilation_failed")
        }
        RuntimeError::QueryExecutionFailed(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "query_execution_failed")
        }
        RuntimeError::ConcurrentModificationConflict(_) => {
            (StatusCode::CONFLICT, "concurrent_modification")
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, details) = match &self {
            AppError::Runtime(e) => {
                let (status, code) = runtime_status(e);
                let details = e
                    .diagnostics()
                    .map(|d| serde_json::to_value(d).unwrap_or(serde_json::Value::Null));
                (status, code, details)
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error", None),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found", None)
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
                }
            }
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict", None),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", None),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
