//! HTTP-facing error type.
//!
//! Every handler returns `AppResult<T>`; errors are rendered through the
//! standard [`ApiResponse`] envelope with a stable error code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::response::ApiResponse;

/// Result alias used by handlers and services.
pub type AppResult<T> = Result<T, AppError>;

/// Application error.
#[derive(Debug, Error)]
pub enum AppError {
    /// Request failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend connection could not be acquired.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// The query referenced a relation that does not exist.
    #[error("{0}")]
    RelationNotFound(String),

    /// The query failed for any other reason.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The connection owning the referenced schema failed to load.
    #[error("{0}")]
    ConnectionLoadFailed(String),

    /// The schema did not become available in time.
    #[error("{0}")]
    QueryTimeout(String),

    /// The request was cancelled before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the error code exposed to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::DatabaseConnection(_) => "DATABASE_CONNECTION_ERROR",
            AppError::RelationNotFound(_) => "RELATION_NOT_FOUND",
            AppError::QueryFailed(_) => "QUERY_FAILED",
            AppError::ConnectionLoadFailed(_) => "CONNECTION_LOAD_FAILED",
            AppError::QueryTimeout(_) => "QUERY_TIMEOUT",
            AppError::Cancelled => "CANCELLED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::RelationNotFound(_) | AppError::QueryFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::ConnectionLoadFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::DatabaseConnection(_) | AppError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "Request rejected");
        }

        let body = ApiResponse::err(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}
