//! HTTP error types for the Gafaelfawr server.
//!
//! Maps domain errors from `gafaelfawr-core` into appropriate HTTP
//! responses. Every error variant produces a JSON body with a
//! machine-readable `error` field and a human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use gafaelfawr_core::{AuthorizationError, HistoryError, TokenError};
use gafaelfawr_storage::StorageError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Authentication failed or token invalid.
    Unauthorized(String),
    /// Authorization denied the operation.
    Forbidden(String),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// A conflict (e.g., duplicate token name).
    Conflict(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<AuthorizationError> for AppError {
    fn from(err: AuthorizationError) -> Self {
        match err {
            AuthorizationError::PermissionDenied(msg) => Self::Forbidden(msg),
        }
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Authorization(inner) => inner.into(),
            TokenError::NotFound => Self::NotFound(err.to_string()),
            TokenError::ScopesTooBroad
            | TokenError::UnknownScopes
            | TokenError::ExpiresTooSoon
            | TokenError::InvalidIpAddress(_)
            | TokenError::InvalidUsername(_)
            | TokenError::NotModifiable => Self::BadRequest(err.to_string()),
            TokenError::DuplicateTokenName(_) => Self::Conflict(err.to_string()),
            TokenError::Storage(ref inner) => match inner {
                StorageError::Open { .. } => Self::Internal(err.to_string()),
                StorageError::Read { .. }
                | StorageError::Write { .. }
                | StorageError::Delete { .. }
                | StorageError::List { .. } => Self::Internal(err.to_string()),
            },
            TokenError::Relational(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<HistoryError> for AppError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::InvalidCursor(_) => Self::BadRequest(err.to_string()),
            HistoryError::Relational(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        Self::Internal(err.to_string())
    }
}
