//! The single current refresh token per principal.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{Store, StoreError};

fn key(principal_id: &str) -> String {
    format!("refresh:{}", principal_id)
}

/// Maps principal ID to its one valid refresh token.
///
/// Writing a new value supersedes the old one immediately, which is how
/// rotation and "newest login wins" are enforced.
#[derive(Clone)]
pub struct RefreshTokenStore {
    store: Arc<dyn Store>,
}

impl RefreshTokenStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Unconditionally replace the stored token.
    pub async fn set(&self, principal_id: &str, token: &str, ttl: Duration) -> Result<(), StoreError> {
        self.store.set(&key(principal_id), token, ttl).await
    }

    pub async fn get(&self, principal_id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&key(principal_id)).await
    }

    /// Swap `presented` for `next` only if `presented` is still the stored value.
    ///
    /// Two concurrent refreshes with the same token cannot both succeed.
    pub async fn rotate(
        &self,
        principal_id: &str,
        presented: &str,
        next: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .compare_and_set(&key(principal_id), presented, next, ttl)
            .await
    }

    pub async fn invalidate(&self, principal_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&key(principal_id)).await
    }
}
