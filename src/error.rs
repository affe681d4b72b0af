//! Error types
//! Mission: Keep infrastructure failures apart from authentication denials

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tracing::{error, warn};

/// Failures raised by the credential store or the session cache.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call exceeded deadline of {0:?}")]
    Timeout(Duration),
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("corrupt document: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("blocking task failed: {e}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Coarse grouping used for HTTP mapping and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Unauthenticated,
    InvalidToken,
    StoreUnavailable,
    SigningError,
    Forbidden,
    BadRequest,
    Conflict,
    NotFound,
    Internal,
}

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("bad credentials")]
    Unauthenticated,
    #[error("token expired")]
    ExpiredToken,
    #[error("token signature invalid")]
    InvalidSignature,
    #[error("token revoked")]
    Revoked,
    #[error("token malformed")]
    MalformedToken,
    #[error("refresh token invalid or already used")]
    InvalidRefreshToken,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("username already taken")]
    UsernameTaken,
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("principal not found")]
    PrincipalNotFound,
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("signing error: {0}")]
    SigningError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AuthError::Unauthenticated => ErrorCategory::Unauthenticated,
            AuthError::ExpiredToken
            | AuthError::InvalidSignature
            | AuthError::Revoked
            | AuthError::MalformedToken
            | AuthError::InvalidRefreshToken => ErrorCategory::InvalidToken,
            AuthError::Forbidden => ErrorCategory::Forbidden,
            AuthError::UsernameTaken => ErrorCategory::Conflict,
            AuthError::WeakPassword(_) | AuthError::InvalidRequest(_) => ErrorCategory::BadRequest,
            AuthError::PrincipalNotFound => ErrorCategory::NotFound,
            AuthError::StoreUnavailable(_) => ErrorCategory::StoreUnavailable,
            AuthError::SigningError(_) => ErrorCategory::SigningError,
            AuthError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// True for every failure that must reach the caller as the uniform denial.
    pub fn is_denial(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Unauthenticated | ErrorCategory::InvalidToken
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(_) => AuthError::UsernameTaken,
            other => AuthError::StoreUnavailable(other),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self.category() {
            // Denials share one body so callers cannot tell which check failed
            ErrorCategory::Unauthenticated | ErrorCategory::InvalidToken => {
                warn!(cause = %self, "Authentication denied");
                (StatusCode::UNAUTHORIZED, "Authentication failed".to_string())
            }
            ErrorCategory::StoreUnavailable => {
                error!(cause = %self, "Authentication backend unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Authentication temporarily unavailable".to_string(),
                )
            }
            ErrorCategory::SigningError | ErrorCategory::Internal => {
                error!(cause = %self, "Internal authentication failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ErrorCategory::Forbidden => {
                (StatusCode::FORBIDDEN, "Insufficient permissions".to_string())
            }
            ErrorCategory::BadRequest => (StatusCode::BAD_REQUEST, self.to_string()),
            ErrorCategory::Conflict => {
                (StatusCode::CONFLICT, "Username already exists".to_string())
            }
            ErrorCategory::NotFound => (StatusCode::NOT_FOUND, "Principal not found".to_string()),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denials_share_status() {
        for err in [
            AuthError::Unauthenticated,
            AuthError::ExpiredToken,
            AuthError::InvalidSignature,
            AuthError::Revoked,
            AuthError::MalformedToken,
            AuthError::InvalidRefreshToken,
        ] {
            assert!(err.is_denial());
            assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_store_failures_fail_closed() {
        let err: AuthError = StoreError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(err.category(), ErrorCategory::StoreUnavailable);
        assert!(!err.is_denial());
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_duplicate_maps_to_conflict() {
        let err: AuthError = StoreError::Duplicate("alice".into()).into();
        assert!(matches!(err, AuthError::UsernameTaken));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_other_statuses() {
        assert_eq!(
            AuthError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::WeakPassword(8).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuthError::PrincipalNotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AuthError::SigningError("no key".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
