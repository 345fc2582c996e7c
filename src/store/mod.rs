//! Shared keyed store behind refresh tokens, the blacklist and rate-limit logs.
//!
//! Every server instance talks to the same store, so none of the session or
//! admission state lives in process-local locks. Backends:
//!
//! - [`MemoryStore`]: single process, used by tests and small deployments
//! - [`crate::db::SqliteStore`]: SQLite tables next to the user table
//! - `RedisStore` (feature `redis`): shared Redis instance

mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryStore;

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached (connection refused, pool exhausted, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend answered with an error.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// How callers react when the store cannot answer a revocation or rate-limit lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Treat the lookup as passing (not revoked, not limited) and log a warning.
    #[default]
    Open,
    /// Reject the request with 503.
    Closed,
}

/// Key-value and timestamp-log operations with per-key expiry.
///
/// Each call is atomic on its own; sequences of calls are not.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrite `key` unconditionally.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of a value or list key. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Replace the value only if the current live value equals `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Append to the list at `key`, returning its new length.
    async fn list_append(&self, key: &str, value: u64) -> Result<usize, StoreError>;

    /// All entries, oldest first.
    async fn list_range(&self, key: &str) -> Result<Vec<u64>, StoreError>;

    /// Drop entries below `older_than` and return what is left, oldest first.
    async fn list_prune(&self, key: &str, older_than: u64) -> Result<Vec<u64>, StoreError>;

    /// Keep only the newest `max_len` entries.
    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError>;

    /// Remove expired keys eagerly. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
