//! Account lookups the session layer depends on.
//!
//! Credentials live in the `users` table as Argon2id PHC strings.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;

use super::Principal;
use crate::db::{Database, User, UserRole};

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("email is already registered")]
    EmailTaken,
    #[error("account not found")]
    NotFound,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The user/account subsystem as seen by [`super::SessionService`].
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn verify_credentials(&self, email: &str, password: &str)
    -> Result<Principal, AccountError>;

    async fn find_principal(&self, principal_id: &str) -> Result<Option<Principal>, AccountError>;

    /// Replace the password after checking the old one.
    async fn change_password(
        &self,
        principal_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AccountError>;

    async fn create_account(
        &self,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> Result<Principal, AccountError>;
}

impl From<User> for Principal {
    fn from(user: User) -> Self {
        Self {
            id: user.uuid,
            email: user.email,
            role: user.role,
        }
    }
}

/// Hash a password with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AccountError::Hash(e.to_string()))
}

/// Check a password against a stored PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AccountError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AccountError::Hash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Argon2 is deliberately slow; keep it off the async workers.
async fn hash_blocking(password: &str) -> Result<String, AccountError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AccountError::Hash(e.to_string()))?
}

async fn verify_blocking(password: &str, hash: &str) -> Result<bool, AccountError> {
    let (password, hash) = (password.to_string(), hash.to_string());
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AccountError::Hash(e.to_string()))?
}

#[async_trait]
impl AccountDirectory for Database {
    async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Principal, AccountError> {
        let user = self
            .users()
            .get_by_email(email)
            .await?
            .ok_or(AccountError::InvalidCredentials)?;

        if !verify_blocking(password, &user.password_hash).await? {
            return Err(AccountError::InvalidCredentials);
        }

        Ok(user.into())
    }

    async fn find_principal(&self, principal_id: &str) -> Result<Option<Principal>, AccountError> {
        Ok(self
            .users()
            .get_by_uuid(principal_id)
            .await?
            .map(Principal::from))
    }

    async fn change_password(
        &self,
        principal_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AccountError> {
        let user = self
            .users()
            .get_by_uuid(principal_id)
            .await?
            .ok_or(AccountError::NotFound)?;

        if !verify_blocking(old_password, &user.password_hash).await? {
            return Err(AccountError::InvalidCredentials);
        }

        let hash = hash_blocking(new_password).await?;
        if !self.users().update_password_hash(principal_id, &hash).await? {
            return Err(AccountError::NotFound);
        }
        Ok(())
    }

    async fn create_account(
        &self,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> Result<Principal, AccountError> {
        if !self.users().is_email_available(email).await? {
            return Err(AccountError::EmailTaken);
        }

        let hash = hash_blocking(password).await?;
        let uuid = uuid::Uuid::new_v4().to_string();

        // A concurrent registration can still win the unique index.
        self.users()
            .create(&uuid, email, &hash, role)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => AccountError::EmailTaken,
                other => AccountError::Database(other),
            })?;

        Ok(Principal {
            id: uuid,
            email: email.to_string(),
            role,
        })
    }
}
