//! Shared error handling for API endpoints.
//!
//! Every failure leaves the server as `{success: false, error: {code, message}}`.
//! The same types deserialize the envelope on the client side.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::session::SessionError;

/// Machine-readable error code carried in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoToken,
    InvalidTokenFormat,
    TokenExpired,
    InvalidToken,
    TokenRevoked,
    InvalidRefresh,
    InvalidCredentials,
    InvalidVerificationCode,
    EmailTaken,
    ValidationError,
    Forbidden,
    NotFound,
    RateLimitExceeded,
    ServiceUnavailable,
    InternalError,
    /// Anything a newer server sends that this build does not know
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

/// Extension trait for concise error mapping on Results.
pub trait ResultExt<T> {
    fn store_err(self, msg: &str) -> Result<T, ApiError>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn store_err(self, msg: &str) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::store_error(msg, e))
    }
}

/// API error type with automatic response conversion.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorCode, String),
    Unauthorized(ErrorCode, String),
    Forbidden(String),
    NotFound(String),
    Conflict(ErrorCode, String),
    RateLimited { retry_after: u64 },
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(ErrorCode::ValidationError, msg.into())
    }

    pub fn unauthorized(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Unauthorized(code, msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn db_error(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        Self::Internal("Database error".into())
    }

    pub fn store_error(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        Self::Unavailable("Session store unavailable".into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::BadRequest(code, _)
            | ApiError::Unauthorized(code, _)
            | ApiError::Conflict(code, _) => *code,
            ApiError::Forbidden(_) => ErrorCode::Forbidden,
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            ApiError::Unavailable(_) => ErrorCode::ServiceUnavailable,
            ApiError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(..) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(..) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidCredentials => ApiError::unauthorized(
                ErrorCode::InvalidCredentials,
                "Invalid email or password",
            ),
            SessionError::InvalidRefresh => ApiError::unauthorized(
                ErrorCode::InvalidRefresh,
                "Refresh token is invalid, please log in again",
            ),
            SessionError::TokenExpired => {
                ApiError::unauthorized(ErrorCode::TokenExpired, "Access token expired")
            }
            SessionError::InvalidToken => {
                ApiError::unauthorized(ErrorCode::InvalidToken, "Invalid access token")
            }
            SessionError::TokenRevoked => {
                ApiError::unauthorized(ErrorCode::TokenRevoked, "Token has been revoked")
            }
            SessionError::EmailTaken => {
                ApiError::Conflict(ErrorCode::EmailTaken, "Email is already registered".into())
            }
            SessionError::AccountNotFound => ApiError::not_found("Account not found"),
            SessionError::Store(e) => ApiError::store_error("Session store error", e),
            SessionError::Token(e) => ApiError::internal_error("Failed to issue token", e),
            SessionError::Account(e) => ApiError::db_error("Account lookup failed", e),
        }
    }
}

impl ApiError {
    fn internal_error(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        Self::Internal(context.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (message, retry_after) = match self {
            ApiError::BadRequest(_, msg)
            | ApiError::Unauthorized(_, msg)
            | ApiError::Conflict(_, msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Internal(msg) => (msg, None),
            ApiError::RateLimited { retry_after } => (
                "Too many requests. Please try again later.".to_string(),
                Some(retry_after),
            ),
        };

        let body = Json(ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code,
                message,
                retry_after,
            },
        });

        match retry_after {
            Some(seconds) => {
                (status, [(header::RETRY_AFTER, seconds.to_string())], body).into_response()
            }
            None => (status, body).into_response(),
        }
    }
}

/// Trim and lowercase an email address, rejecting obviously invalid ones.
pub fn validate_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::bad_request("Email cannot be empty"));
    }
    if email.len() > 254 {
        return Err(ApiError::bad_request("Email is too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(ApiError::bad_request("Invalid email format")),
    }
}

/// Length limits for new passwords.
pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.len() < 8 {
        return Err(ApiError::bad_request(
            "Password must be at least 8 characters",
        ));
    }
    if password.len() > 128 {
        return Err(ApiError::bad_request("Password is too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::InvalidTokenFormat).unwrap(),
            "\"INVALID_TOKEN_FORMAT\""
        );
        let parsed: ErrorCode = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(parsed, ErrorCode::Unknown);
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = ApiError::RateLimited { retry_after: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_validate_email() {
        assert_eq!(validate_email("  A@X.com ").unwrap(), "a@x.com");
        assert!(validate_email("").is_err());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@x.com").is_err());
        assert!(validate_email("a@localhost").is_err());
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password(&"x".repeat(129)).is_err());
    }
}
