//! Login, refresh, logout and password-change orchestration.
//!
//! Access tokens are stateless until revoked; refresh tokens are rotated on
//! every use and only the most recently issued one per principal is accepted.

mod account;
mod blacklist;
mod refresh_store;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub use account::{AccountDirectory, AccountError, hash_password, verify_password};
pub use blacklist::TokenBlacklist;
pub use refresh_store::RefreshTokenStore;

use crate::db::UserRole;
use crate::jwt::{Claims, TokenCodec, TokenError, TokenType, decode_unsafe};
use crate::store::{FailurePolicy, Store, StoreError};

/// Identity that tokens are issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub role: UserRole,
}

/// Access/refresh pair as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a successful login, registration or refresh.
#[derive(Debug, Clone)]
pub struct Session {
    pub tokens: TokenPair,
    pub principal: Principal,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid email or password")]
    InvalidCredentials,
    /// Refresh token expired, superseded, revoked or forged. Fatal for the client.
    #[error("refresh token is invalid or has been superseded")]
    InvalidRefresh,
    #[error("access token expired")]
    TokenExpired,
    #[error("access token is invalid")]
    InvalidToken,
    #[error("access token has been revoked")]
    TokenRevoked,
    #[error("email is already registered")]
    EmailTaken,
    #[error("account not found")]
    AccountNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Token(TokenError),
    #[error(transparent)]
    Account(AccountError),
}

impl From<AccountError> for SessionError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::InvalidCredentials => SessionError::InvalidCredentials,
            AccountError::EmailTaken => SessionError::EmailTaken,
            AccountError::NotFound => SessionError::AccountNotFound,
            other => SessionError::Account(other),
        }
    }
}

#[derive(Clone)]
pub struct SessionService {
    codec: TokenCodec,
    refresh_tokens: RefreshTokenStore,
    blacklist: TokenBlacklist,
    accounts: Arc<dyn AccountDirectory>,
    failure_policy: FailurePolicy,
}

impl SessionService {
    pub fn new(
        codec: TokenCodec,
        store: Arc<dyn Store>,
        accounts: Arc<dyn AccountDirectory>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            codec,
            refresh_tokens: RefreshTokenStore::new(store.clone()),
            blacklist: TokenBlacklist::new(store),
            accounts,
            failure_policy,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Issue a fresh pair and make its refresh token the only valid one.
    async fn start_session(&self, principal: Principal) -> Result<Session, SessionError> {
        let access = self
            .codec
            .issue_access(&principal)
            .map_err(SessionError::Token)?;
        let refresh = self
            .codec
            .issue_refresh(&principal)
            .map_err(SessionError::Token)?;

        self.refresh_tokens
            .set(&principal.id, &refresh.token, self.codec.refresh_ttl())
            .await?;

        Ok(Session {
            tokens: TokenPair {
                access_token: access.token,
                refresh_token: refresh.token,
            },
            principal,
            expires_in: access.duration,
        })
    }

    /// Check credentials and start a session.
    ///
    /// Any earlier refresh token for the same principal stops working.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, SessionError> {
        let principal = self.accounts.verify_credentials(email, password).await?;
        let session = self.start_session(principal).await?;
        info!(principal_id = %session.principal.id, "Login succeeded");
        Ok(session)
    }

    /// Create a regular account and start a session for it.
    pub async fn register(&self, email: &str, password: &str) -> Result<Session, SessionError> {
        let principal = self
            .accounts
            .create_account(email, password, UserRole::User)
            .await?;
        info!(principal_id = %principal.id, "Account registered");
        self.start_session(principal).await
    }

    /// Exchange a refresh token for a new pair, rotating both tokens.
    pub async fn refresh(&self, presented: &str) -> Result<Session, SessionError> {
        let claims = self
            .codec
            .verify(presented, TokenType::Refresh)
            .map_err(|_| SessionError::InvalidRefresh)?;

        // Re-read the principal so role changes take effect at rotation
        let principal = self
            .accounts
            .find_principal(&claims.sub)
            .await?
            .ok_or(SessionError::InvalidRefresh)?;

        let access = self
            .codec
            .issue_access(&principal)
            .map_err(SessionError::Token)?;
        let refresh = self
            .codec
            .issue_refresh(&principal)
            .map_err(SessionError::Token)?;

        let rotated = self
            .refresh_tokens
            .rotate(
                &principal.id,
                presented,
                &refresh.token,
                self.codec.refresh_ttl(),
            )
            .await?;

        if !rotated {
            warn!(
                principal_id = %principal.id,
                "Refresh token does not match the stored token (superseded, revoked or replayed)"
            );
            return Err(SessionError::InvalidRefresh);
        }

        Ok(Session {
            tokens: TokenPair {
                access_token: access.token,
                refresh_token: refresh.token,
            },
            principal,
            expires_in: access.duration,
        })
    }

    /// Verify an access token and make sure it has not been revoked.
    pub async fn authenticate(&self, access_token: &str) -> Result<Claims, SessionError> {
        let claims = self
            .codec
            .verify(access_token, TokenType::Access)
            .map_err(|e| match e {
                TokenError::Expired => SessionError::TokenExpired,
                _ => SessionError::InvalidToken,
            })?;

        match self.blacklist.contains(access_token).await {
            Ok(true) => Err(SessionError::TokenRevoked),
            Ok(false) => Ok(claims),
            Err(e) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(error = %e, "Blacklist lookup failed, accepting token");
                    Ok(claims)
                }
                FailurePolicy::Closed => Err(SessionError::Store(e)),
            },
        }
    }

    /// Revoke the access token and the principal's refresh token.
    ///
    /// An expired token still logs out, as long as its signature holds. Store
    /// errors are logged, not returned: the client clears its state anyway.
    pub async fn logout(&self, access_token: &str) -> Result<(), SessionError> {
        let claims = match self.codec.verify(access_token, TokenType::Access) {
            Ok(claims) => claims,
            // Signature and type were checked before expiry
            Err(TokenError::Expired) => {
                decode_unsafe(access_token).ok_or(SessionError::InvalidToken)?
            }
            Err(_) => return Err(SessionError::InvalidToken),
        };

        self.revoke(access_token, &claims).await;
        info!(principal_id = %claims.sub, "Logged out");
        Ok(())
    }

    async fn revoke(&self, access_token: &str, claims: &Claims) {
        let remaining = self.codec.remaining_lifetime(claims);
        if let Err(e) = self.blacklist.add(access_token, remaining).await {
            warn!(principal_id = %claims.sub, error = %e, "Failed to blacklist access token");
        }
        if let Err(e) = self.refresh_tokens.invalidate(&claims.sub).await {
            warn!(principal_id = %claims.sub, error = %e, "Failed to invalidate refresh token");
        }
    }

    /// Change the password and log the principal out everywhere.
    ///
    /// `active_access_token` is the token the request was made with; it is revoked too.
    pub async fn change_password(
        &self,
        principal_id: &str,
        old_password: &str,
        new_password: &str,
        active_access_token: Option<&str>,
    ) -> Result<(), SessionError> {
        self.accounts
            .change_password(principal_id, old_password, new_password)
            .await?;

        match active_access_token.and_then(|t| self.codec.verify(t, TokenType::Access).ok().map(|c| (t, c))) {
            Some((token, claims)) if claims.sub == principal_id => self.revoke(token, &claims).await,
            _ => {
                if let Err(e) = self.refresh_tokens.invalidate(principal_id).await {
                    warn!(principal_id = %principal_id, error = %e, "Failed to invalidate refresh token");
                }
            }
        }

        info!(principal_id = %principal_id, "Password changed, sessions invalidated");
        Ok(())
    }
}
