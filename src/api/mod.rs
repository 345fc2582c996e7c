mod auth;
mod error;

use axum::Router;

pub use auth::AuthState;
pub use error::{ApiError, ErrorBody, ErrorCode, ErrorEnvelope, ResultExt};

use crate::rate_limit::RateLimitState;

/// Create the API router.
pub fn create_api_router(auth_state: AuthState, rate_limits: RateLimitState) -> Router {
    Router::new().nest("/auth", auth::router(auth_state, rate_limits))
}
