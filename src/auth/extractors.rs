//! Axum extractors for authentication.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::bearer::bearer_token;
use super::errors::{ApiAuthError, AuthErrorKind};
use super::state::HasAuthBackend;
use super::types::AuthenticatedPrincipal;

/// Header parsing, signature and expiry check, then the blacklist lookup.
async fn authenticate_request<S>(
    parts: &Parts,
    state: &S,
) -> Result<AuthenticatedPrincipal, AuthErrorKind>
where
    S: HasAuthBackend + Send + Sync,
{
    let token = bearer_token(&parts.headers)?;
    let claims = state.sessions().authenticate(token).await?;

    Ok(AuthenticatedPrincipal {
        claims,
        token: token.to_string(),
    })
}

/// Extractor for endpoints that require a valid access token.
///
/// Rejects with 401 and one of `NO_TOKEN`, `INVALID_TOKEN_FORMAT`,
/// `TOKEN_EXPIRED`, `INVALID_TOKEN` or `TOKEN_REVOKED`.
pub struct Auth(pub AuthenticatedPrincipal);

impl<S> FromRequestParts<S> for Auth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        authenticate_request(parts, state)
            .await
            .map(Auth)
            .map_err(ApiAuthError::from)
    }
}
