//! Scheduled removal of expired store entries.
//!
//! Reads already ignore expired entries; this only reclaims space in backends
//! that expire lazily.

use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Interval between cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); // 1 hour

/// Run all cleanup tasks once.
pub async fn run_cleanup(store: &dyn Store) {
    match store.purge_expired().await {
        Ok(count) if count > 0 => info!("Cleaned up {} expired store entries", count),
        Ok(_) => {}
        Err(e) => error!("Failed to clean up expired store entries: {}", e),
    }
}

/// Spawn a background task that runs cleanup periodically.
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_scheduler(store: Arc<dyn Store>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            run_cleanup(store.as_ref()).await;
        }
    })
}
