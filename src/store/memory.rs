//! In-process store implementation.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Store, StoreError};
use crate::clock::{Clock, SystemClock};

#[derive(Debug)]
enum Value {
    Text(String),
    List(VecDeque<u64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    /// Expiry in clock milliseconds; `None` never expires.
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Mutex-guarded map with lazy expiry. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn deadline(&self, ttl: Duration) -> Option<u64> {
        Some(self.clock.now_millis() + ttl.as_millis() as u64)
    }

    /// Drop `key` if it has expired, so callers only ever see live entries.
    fn evict_if_expired(map: &mut HashMap<String, Entry>, key: &str, now: u64) {
        if map.get(key).is_some_and(|e| !e.is_live(now)) {
            map.remove(key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Self::evict_if_expired(&mut map, key, now);
        Ok(match map.get(key) {
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.deadline(ttl);
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let removed = self.lock()?.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = self.deadline(ttl);
        let mut map = self.lock()?;
        Self::evict_if_expired(&mut map, key, now);
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = self.deadline(ttl);
        let mut map = self.lock()?;
        Self::evict_if_expired(&mut map, key, now);
        match map.get_mut(key) {
            Some(entry) if matches!(&entry.value, Value::Text(v) if v == expected) => {
                entry.value = Value::Text(new.to_string());
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_append(&self, key: &str, value: u64) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Self::evict_if_expired(&mut map, key, now);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                list.push_back(value);
                Ok(list.len())
            }
            Value::Text(_) => Err(StoreError::Backend(format!(
                "key {} does not hold a list",
                key
            ))),
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Self::evict_if_expired(&mut map, key, now);
        Ok(match map.get(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list.iter().copied().collect(),
            _ => Vec::new(),
        })
    }

    async fn list_prune(&self, key: &str, older_than: u64) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Self::evict_if_expired(&mut map, key, now);
        Ok(match map.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                list.retain(|ts| *ts >= older_than);
                list.iter().copied().collect()
            }
            _ => Vec::new(),
        })
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        if let Some(Entry {
            value: Value::List(list),
            ..
        }) = map.get_mut(key)
        {
            while list.len() > max_len {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|_, entry| entry.is_live(now));
        Ok((before - map.len()) as u64)
    }
}
