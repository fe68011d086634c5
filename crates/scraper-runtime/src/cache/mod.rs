//! TTL cache for fetched payloads.
//!
//! The backend is chosen once from configuration: an in-memory map with lazy
//! expiry, or Redis with native expiry. A Redis backend that cannot be reached
//! at construction time downgrades to memory instead of failing.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryCache;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisCache;

use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{CacheBackendKind, CacheConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache size snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub entries: usize,
}

/// Key/value store with per-entry TTL
pub enum CacheStore {
    Memory(MemoryCache),
    #[cfg(feature = "redis-backend")]
    Redis(RedisCache),
}

impl CacheStore {
    pub fn memory() -> Self {
        CacheStore::Memory(MemoryCache::new())
    }

    /// Build the configured backend for one instance.
    ///
    /// `namespace` scopes keys on a shared external store.
    pub async fn from_config(config: &CacheConfig, namespace: &str) -> Self {
        match config.backend {
            CacheBackendKind::Memory => {
                debug!(namespace = namespace, "Using in-memory cache backend");
                Self::memory()
            }
            CacheBackendKind::Redis => Self::connect_redis(config, namespace).await,
        }
    }

    #[cfg(feature = "redis-backend")]
    async fn connect_redis(config: &CacheConfig, namespace: &str) -> Self {
        let namespace = format!("{}:{}:", config.key_prefix, namespace);
        let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));

        match RedisCache::connect(&config.redis_url, namespace, timeout).await {
            Ok(cache) => {
                info!(url = %config.redis_url, "Using Redis cache backend");
                CacheStore::Redis(cache)
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize Redis, using in-memory cache");
                Self::memory()
            }
        }
    }

    #[cfg(not(feature = "redis-backend"))]
    async fn connect_redis(_config: &CacheConfig, _namespace: &str) -> Self {
        warn!("Redis support is not compiled in, using in-memory cache");
        Self::memory()
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            CacheStore::Memory(_) => "memory",
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(_) => "redis",
        }
    }

    /// Get a live value. Missing, expired and undecodable entries are all `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self {
            CacheStore::Memory(cache) => cache.get(key),
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(cache) => cache.get(key).await,
        };

        let Some(value) = value else {
            debug!(key = key, "Cache miss");
            return None;
        };

        match serde_json::from_value(value) {
            Ok(data) => {
                debug!(key = key, "Cache hit");
                Some(data)
            }
            Err(e) => {
                warn!(key = key, error = %e, "Cached value has an unexpected shape, ignoring");
                None
            }
        }
    }

    /// Store a value for `ttl`. Zero TTLs and null values are refused.
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) -> bool {
        if ttl.is_zero() {
            warn!(key = key, "Refusing to cache with a zero TTL");
            return false;
        }

        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to serialize cache data");
                return false;
            }
        };
        if value.is_null() {
            debug!(key = key, "Not caching null value");
            return false;
        }

        let stored = match self {
            CacheStore::Memory(cache) => cache.set(key, value, ttl),
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(cache) => cache.set(key, &value, ttl).await,
        };
        if stored {
            debug!(key = key, ttl_secs = ttl.as_secs(), "Cache stored");
        }
        stored
    }

    pub async fn delete(&self, key: &str) -> bool {
        let removed = match self {
            CacheStore::Memory(cache) => cache.delete(key),
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(cache) => cache.delete(key).await,
        };
        if removed {
            debug!(key = key, "Cache delete");
        }
        removed
    }

    pub async fn clear(&self) -> bool {
        let cleared = match self {
            CacheStore::Memory(cache) => cache.clear(),
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(cache) => cache.clear().await,
        };
        if cleared {
            info!(backend = self.backend_name(), "Cache cleared");
        }
        cleared
    }

    /// Sweep expired entries. Redis expires on its own and always reports 0.
    pub fn purge_expired(&self) -> usize {
        match self {
            CacheStore::Memory(cache) => cache.purge_expired(),
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(_) => 0,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match self {
            CacheStore::Memory(cache) => cache.entry_count(),
            #[cfg(feature = "redis-backend")]
            CacheStore::Redis(cache) => cache.entry_count().await,
        };
        CacheStats {
            backend: self.backend_name(),
            entries,
        }
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// `compute` runs at most once per call; its error is returned as-is and
    /// nothing is stored.
    pub async fn get_or_set<T, E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}
