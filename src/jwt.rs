//! JWT token generation and validation.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::db::UserRole;
use crate::session::Principal;

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived access token, never stored server-side except when revoked
    Access,
    /// Long-lived refresh token, one current value stored per principal
    Refresh,
}

/// JWT claims shared by access and refresh tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (principal UUID)
    pub sub: String,
    pub email: String,
    pub role: UserRole,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Random ID so that two tokens issued in the same second never collide
    pub jti: String,
    /// Issued at (Unix seconds)
    pub iat: u64,
    /// Expiration time (Unix seconds)
    pub exp: u64,
}

/// Access token lifetime: 30 minutes
pub const ACCESS_TOKEN_DURATION_SECS: u64 = 30 * 60;

/// Refresh token lifetime: 7 days
pub const REFRESH_TOKEN_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Secrets and lifetimes for both token kinds.
#[derive(Clone)]
pub struct TokenSettings {
    pub access_secret: Vec<u8>,
    pub refresh_secret: Vec<u8>,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenSettings {
    /// Settings with the default lifetimes.
    pub fn new(access_secret: &[u8], refresh_secret: &[u8]) -> Self {
        Self {
            access_secret: access_secret.to_vec(),
            refresh_secret: refresh_secret.to_vec(),
            access_ttl: Duration::from_secs(ACCESS_TOKEN_DURATION_SECS),
            refresh_ttl: Duration::from_secs(REFRESH_TOKEN_DURATION_SECS),
        }
    }
}

/// A freshly signed token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
    /// Token lifetime in seconds
    pub duration: u64,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

/// Signs and verifies access and refresh tokens with independent secrets.
#[derive(Clone)]
pub struct TokenCodec {
    access: Arc<KeyPair>,
    refresh: Arc<KeyPair>,
    access_ttl: u64,
    refresh_ttl: u64,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(settings: &TokenSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: &TokenSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            access: Arc::new(KeyPair::from_secret(&settings.access_secret)),
            refresh: Arc::new(KeyPair::from_secret(&settings.refresh_secret)),
            access_ttl: settings.access_ttl.as_secs(),
            refresh_ttl: settings.refresh_ttl.as_secs(),
            clock,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl)
    }

    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    fn keys(&self, kind: TokenType) -> &KeyPair {
        match kind {
            TokenType::Access => &self.access,
            TokenType::Refresh => &self.refresh,
        }
    }

    fn issue(&self, principal: &Principal, kind: TokenType) -> Result<IssuedToken, TokenError> {
        let now = self.clock.now_secs();
        let duration = match kind {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };

        let claims = Claims {
            sub: principal.id.clone(),
            email: principal.email.clone(),
            role: principal.role,
            token_type: kind,
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + duration,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.keys(kind).encoding)
            .map_err(TokenError::Encoding)?;

        Ok(IssuedToken {
            token,
            claims,
            duration,
        })
    }

    /// Sign a short-lived access token for a principal.
    pub fn issue_access(&self, principal: &Principal) -> Result<IssuedToken, TokenError> {
        self.issue(principal, TokenType::Access)
    }

    /// Sign a long-lived refresh token for a principal.
    pub fn issue_refresh(&self, principal: &Principal) -> Result<IssuedToken, TokenError> {
        self.issue(principal, TokenType::Refresh)
    }

    /// Check signature, structure, token type and expiry.
    ///
    /// Expiry is compared against the injected clock without leeway.
    pub fn verify(&self, token: &str, kind: TokenType) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = false;

        let token_data = jsonwebtoken::decode::<Claims>(token, &self.keys(kind).decoding, &validation)
            .map_err(TokenError::Malformed)?;

        let claims = token_data.claims;
        if claims.token_type != kind {
            return Err(TokenError::WrongTokenType);
        }

        if self.clock.now_secs() > claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Time left until [`Self::verify`] starts reporting the token as expired.
    ///
    /// `exp` is inclusive at second resolution, so the token verifies until the
    /// end of that second. Zero once it has passed.
    pub fn remaining_lifetime(&self, claims: &Claims) -> Duration {
        let end_ms = claims.exp.saturating_add(1).saturating_mul(1000);
        Duration::from_millis(end_ms.saturating_sub(self.clock.now_millis()))
    }

    /// Whether `token` expires within `threshold`. Undecodable tokens count as expiring.
    pub fn is_near_expiry(&self, token: &str, threshold: Duration) -> bool {
        expires_within(token, threshold, self.clock.now_secs())
    }
}

/// Signature-free expiry check for holders of a token who lack its secret.
pub fn expires_within(token: &str, threshold: Duration, now_secs: u64) -> bool {
    match decode_unsafe(token) {
        Some(claims) => now_secs + threshold.as_secs() >= claims.exp,
        None => true,
    }
}

/// Read claims without checking the signature or expiry.
///
/// Only for probing expiry on the client; never trust the result for authorization.
pub fn decode_unsafe(token: &str) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;

    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .map(|data| data.claims)
}

/// Errors that can occur during JWT operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to encode token: {0}")]
    Encoding(jsonwebtoken::errors::Error),
    #[error("malformed token: {0}")]
    Malformed(jsonwebtoken::errors::Error),
    /// Wrong token type (e.g., using refresh token as access token)
    #[error("wrong token type")]
    WrongTokenType,
    #[error("token expired")]
    Expired,
}

impl TokenError {
    pub fn is_expired(&self) -> bool {
        matches!(self, TokenError::Expired)
    }
}
