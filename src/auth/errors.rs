//! Authentication error types.

use axum::response::{IntoResponse, Response};

use crate::api::{ApiError, ErrorCode};
use crate::session::SessionError;

/// Internal auth error kind used by the core authentication logic.
#[derive(Debug)]
pub enum AuthErrorKind {
    NoToken,
    InvalidTokenFormat,
    TokenExpired,
    InvalidToken,
    TokenRevoked,
    StoreUnavailable,
}

/// API authentication errors, rendered in the standard error envelope.
#[derive(Debug)]
pub struct ApiAuthError(pub(super) AuthErrorKind);

impl From<AuthErrorKind> for ApiAuthError {
    fn from(kind: AuthErrorKind) -> Self {
        Self(kind)
    }
}

impl From<SessionError> for AuthErrorKind {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::TokenExpired => AuthErrorKind::TokenExpired,
            SessionError::TokenRevoked => AuthErrorKind::TokenRevoked,
            SessionError::Store(e) => {
                tracing::error!("Blacklist lookup failed: {}", e);
                AuthErrorKind::StoreUnavailable
            }
            _ => AuthErrorKind::InvalidToken,
        }
    }
}

impl From<ApiAuthError> for ApiError {
    fn from(e: ApiAuthError) -> Self {
        match e.0 {
            AuthErrorKind::NoToken => {
                ApiError::unauthorized(ErrorCode::NoToken, "No access token provided")
            }
            AuthErrorKind::InvalidTokenFormat => ApiError::unauthorized(
                ErrorCode::InvalidTokenFormat,
                "Authorization header must be 'Bearer <token>'",
            ),
            AuthErrorKind::TokenExpired => {
                ApiError::unauthorized(ErrorCode::TokenExpired, "Access token expired")
            }
            AuthErrorKind::InvalidToken => {
                ApiError::unauthorized(ErrorCode::InvalidToken, "Invalid access token")
            }
            AuthErrorKind::TokenRevoked => {
                ApiError::unauthorized(ErrorCode::TokenRevoked, "Token has been revoked")
            }
            AuthErrorKind::StoreUnavailable => {
                ApiError::unavailable("Session store unavailable")
            }
        }
    }
}

impl IntoResponse for ApiAuthError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
