//! SQLite-backed [`Store`] for single-database deployments.
//!
//! Several server processes pointed at the same database file share session
//! and rate-limit state. Expired rows are invisible to reads and removed by
//! [`Store::purge_expired`] from the cleanup scheduler.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn now(&self) -> i64 {
        self.clock.now_millis() as i64
    }

    fn deadline(&self, ttl: Duration) -> i64 {
        self.now() + ttl.as_millis() as i64
    }

    /// Remove a list whose expiry has passed so it restarts empty.
    ///
    /// Only writes, so as the first statement of a transaction it takes the
    /// write lock up front and waits on the busy timeout rather than failing
    /// a later lock upgrade.
    async fn evict_expired_list(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        key: &str,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM list_entries WHERE key = ? AND EXISTS (
                SELECT 1 FROM list_meta WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?
            )",
        )
        .bind(key)
        .bind(key)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            "DELETE FROM list_meta WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(key)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn list_values(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        key: &str,
    ) -> Result<Vec<u64>, sqlx::Error> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT value FROM list_entries WHERE key = ? ORDER BY value, id")
                .bind(key)
                .fetch_all(&mut **tx)
                .await?;
        Ok(rows.into_iter().map(|(v,)| v as u64).collect())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(self.deadline(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;

        let value = sqlx::query(
            "DELETE FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let list = sqlx::query(
            "DELETE FROM list_meta WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Expired leftovers go too
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM list_meta WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM list_entries WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(value.rows_affected() + list.rows_affected() > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.now();
        let deadline = self.deadline(ttl);

        let value = sqlx::query(
            "UPDATE kv_entries SET expires_at = ? WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(deadline)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if value.rows_affected() > 0 {
            return Ok(true);
        }

        let list = sqlx::query(
            "UPDATE list_meta SET expires_at = ? WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(deadline)
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(list.rows_affected() > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE kv_entries SET value = ?, expires_at = ?
             WHERE key = ? AND value = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(new)
        .bind(self.deadline(ttl))
        .bind(key)
        .bind(expected)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_append(&self, key: &str, value: u64) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::evict_expired_list(&mut tx, key, self.now()).await?;

        sqlx::query("INSERT OR IGNORE INTO list_meta (key, expires_at) VALUES (?, NULL)")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO list_entries (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value as i64)
            .execute(&mut *tx)
            .await?;
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM list_entries WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count.0 as usize)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<u64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::evict_expired_list(&mut tx, key, self.now()).await?;
        let values = Self::list_values(&mut tx, key).await?;
        tx.commit().await?;
        Ok(values)
    }

    async fn list_prune(&self, key: &str, older_than: u64) -> Result<Vec<u64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::evict_expired_list(&mut tx, key, self.now()).await?;

        sqlx::query("DELETE FROM list_entries WHERE key = ? AND value < ?")
            .bind(key)
            .bind(older_than as i64)
            .execute(&mut *tx)
            .await?;
        let values = Self::list_values(&mut tx, key).await?;

        tx.commit().await?;
        Ok(values)
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM list_entries WHERE key = ? AND id NOT IN (
                SELECT id FROM list_entries WHERE key = ? ORDER BY value DESC, id DESC LIMIT ?
            )",
        )
        .bind(key)
        .bind(key)
        .bind(max_len as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;

        let values = sqlx::query(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM list_entries WHERE key IN (
                SELECT key FROM list_meta WHERE expires_at IS NOT NULL AND expires_at <= ?
            )",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let lists = sqlx::query(
            "DELETE FROM list_meta WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(values.rows_affected() + lists.rows_affected())
    }
}
