//! Authentication principal types.

use crate::jwt::Claims;

/// Principal extracted from a verified, unrevoked access token.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub claims: Claims,
    /// The raw access token, needed to revoke it on logout
    pub token: String,
}

impl AuthenticatedPrincipal {
    pub fn id(&self) -> &str {
        &self.claims.sub
    }
}
