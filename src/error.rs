//! Error types shared by every medgate service and their HTTP mapping.

use crate::config::ConfigError;
use crate::storage::StorageError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MedgateError>;

/// Errors surfaced to callers of the access engine
#[derive(Error, Debug)]
pub enum MedgateError {
    /// Unknown username, wrong password or inactive account. The three are
    /// deliberately indistinguishable.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Access denied. No token provided.")]
    TokenMissing,

    /// Malformed, tampered, expired or logged-out token
    #[error("Invalid or expired token.")]
    TokenInvalid,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MedgateError {
    /// HTTP status code the route layer should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            MedgateError::InvalidCredentials
            | MedgateError::TokenMissing
            | MedgateError::TokenInvalid => StatusCode::UNAUTHORIZED,
            MedgateError::Forbidden(_) => StatusCode::FORBIDDEN,
            MedgateError::NotFound(_) => StatusCode::NOT_FOUND,
            MedgateError::Conflict(_) => StatusCode::CONFLICT,
            MedgateError::Validation(_) => StatusCode::BAD_REQUEST,
            MedgateError::StoreUnavailable(_)
            | MedgateError::Config(_)
            | MedgateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller. Store and internal details stay in
    /// the server log.
    pub fn public_message(&self) -> String {
        match self {
            MedgateError::StoreUnavailable(_)
            | MedgateError::Config(_)
            | MedgateError::Internal(_) => "Server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for MedgateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AlreadyExists(what) => MedgateError::Conflict(what),
            StorageError::NotFound(what) => MedgateError::NotFound(what),
            err @ StorageError::RoleInUse { .. } => MedgateError::Conflict(err.to_string()),
            StorageError::InvalidArgument(what) => MedgateError::Validation(what),
            other => MedgateError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<ConfigError> for MedgateError {
    fn from(err: ConfigError) -> Self {
        MedgateError::Config(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for MedgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorBody {
            success: false,
            message: self.public_message(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            MedgateError::InvalidCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(MedgateError::TokenMissing.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(MedgateError::TokenInvalid.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            MedgateError::Forbidden("no".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            MedgateError::NotFound("gone".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MedgateError::Conflict("dup".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            MedgateError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MedgateError::StoreUnavailable("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_details_are_hidden() {
        let err = MedgateError::StoreUnavailable("connection refused to 10.1.2.3".into());
        assert_eq!(err.public_message(), "Server error");

        let err = MedgateError::Forbidden("Access denied. Required roles: Admin".into());
        assert_eq!(err.public_message(), "Access denied. Required roles: Admin");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: MedgateError = StorageError::AlreadyExists("Username already exists".into()).into();
        assert!(matches!(err, MedgateError::Conflict(_)));

        let err: MedgateError = StorageError::Unavailable("pool closed".into()).into();
        assert!(matches!(err, MedgateError::StoreUnavailable(_)));

        let err: MedgateError = StorageError::InvalidArgument("offset out of range".into()).into();
        assert!(matches!(err, MedgateError::Validation(_)));
    }
}
