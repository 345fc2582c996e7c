//! Redis store for deployments with more than one server instance.
//!
//! Timestamp logs are sorted sets scored by the timestamp, so pruning is a
//! single `ZREMRANGEBYSCORE`. Redis expires keys on its own.

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolConfig, Runtime};
use std::time::Duration;

use super::{Store, StoreError};

const COMPARE_AND_SET: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
";

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    /// Bound on each command once a connection is in hand
    timeout: Duration,
}

impl RedisStore {
    /// Build a pool for `url`. Every pool operation and every command is bounded by `timeout`.
    pub async fn connect(url: &str, pool_size: usize, timeout: Duration) -> Result<Self, StoreError> {
        let mut config = deadpool_redis::Config::from_url(url);
        let mut pool_config = PoolConfig::new(pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        // Fail at startup rather than on the first request.
        pool.get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!(url = %url, "Connected to Redis");
        Ok(Self { pool, timeout })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to get Redis connection");
            StoreError::Unavailable(e.to_string())
        })
    }
}

fn map_err(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Run a command, giving up with `Unavailable` once `timeout` passes.
///
/// A hung connection would otherwise hold the request for as long as the
/// socket stays open.
async fn bounded<T>(
    timeout: Duration,
    command: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, command).await {
        Ok(result) => result.map_err(map_err),
        Err(_) => Err(StoreError::Unavailable(format!(
            "redis command timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = bounded(
            self.timeout,
            redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn),
        )
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = bounded(
            self.timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = bounded(
            self.timeout,
            redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn),
        )
        .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated: i64 = bounded(
            self.timeout,
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await?;
        Ok(updated == 1)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let swapped: i64 = bounded(
            self.timeout,
            redis::Script::new(COMPARE_AND_SET)
                .key(key)
                .arg(expected)
                .arg(new)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(swapped == 1)
    }

    async fn list_append(&self, key: &str, value: u64) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        // Members must be unique; two requests may share a millisecond.
        let member = format!("{}-{}", value, uuid::Uuid::new_v4().simple());
        let (_, len): (i64, i64) = bounded(
            self.timeout,
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(key)
                .arg(value)
                .arg(member)
                .cmd("ZCARD")
                .arg(key)
                .query_async(&mut conn),
        )
        .await?;
        Ok(len as usize)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, f64)> = bounded(
            self.timeout,
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async(&mut conn),
        )
        .await?;
        Ok(entries.into_iter().map(|(_, score)| score as u64).collect())
    }

    async fn list_prune(&self, key: &str, older_than: u64) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.conn().await?;
        let (_, entries): (i64, Vec<(String, f64)>) = bounded(
            self.timeout,
            redis::pipe()
                .atomic()
                .cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(format!("({}", older_than))
                .cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .arg("WITHSCORES")
                .query_async(&mut conn),
        )
        .await?;
        Ok(entries.into_iter().map(|(_, score)| score as u64).collect())
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let stop = -(max_len as i64) - 1;
        let _: i64 = bounded(
            self.timeout,
            redis::cmd("ZREMRANGEBYRANK")
                .arg(key)
                .arg(0)
                .arg(stop)
                .query_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Ok(0)
    }
}
