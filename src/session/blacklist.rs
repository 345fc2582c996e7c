//! Access tokens revoked before their natural expiry.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{Store, StoreError};

fn key(token: &str) -> String {
    format!("blacklist:{}", token)
}

/// Revocation list keyed by access-token value.
///
/// Entries live exactly as long as the token would have, so the list never
/// grows past the set of tokens that could still verify.
#[derive(Clone)]
pub struct TokenBlacklist {
    store: Arc<dyn Store>,
}

impl TokenBlacklist {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Revoke `token` for `ttl`. A zero TTL is a no-op: the token has already expired.
    pub async fn add(&self, token: &str, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.store.set(&key(token), "1", ttl).await
    }

    pub async fn contains(&self, token: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(&key(token)).await?.is_some())
    }
}
