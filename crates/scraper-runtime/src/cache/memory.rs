//! Process-local TTL cache.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Entry count above which `set` sweeps expired entries
const PRUNE_THRESHOLD: usize = 1024;

/// A cached value with expiration time.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// In-memory map storing values with their expiry, checked lazily on read
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.write();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            debug!(key = key, "Cache entry expired");
        }
        None
    }

    pub fn set(&self, key: &str, value: Value, ttl: Duration) -> bool {
        let mut entries = self.write();
        entries.insert(key.to_string(), CacheEntry::new(value, ttl));

        if entries.len() > PRUNE_THRESHOLD {
            let now = Instant::now();
            entries.retain(|_, entry| !entry.is_expired(now));
        }
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    pub fn clear(&self) -> bool {
        self.write().clear();
        true
    }

    /// Remove expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed = removed, "Cleaned up expired cache entries");
        }
        removed
    }

    /// Number of live entries
    pub fn entry_count(&self) -> usize {
        let now = Instant::now();
        self.read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }
}
