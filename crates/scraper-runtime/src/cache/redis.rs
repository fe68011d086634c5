//! Redis-backed TTL cache.
//!
//! Expiry is delegated to Redis (`PSETEX`); values are stored as JSON.
//! Every key lives under a per-instance namespace so clearing one instance
//! never touches another instance sharing the same database.

use crate::error::{Result, ScraperError};
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

/// Keys deleted per `DEL` while clearing a namespace
const SCAN_BATCH: usize = 500;

pub struct RedisCache {
    conn: MultiplexedConnection,
    /// `<key_prefix>:<instance>:`
    namespace: String,
}

impl RedisCache {
    /// Connect and verify the server answers `PING` within `timeout`.
    pub async fn connect(url: &str, namespace: String, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ScraperError::CacheBackend(format!("Invalid Redis URL: {}", e)))?;

        let connect = async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("PING").query_async::<String>(&mut conn).await?;
            Ok::<_, redis::RedisError>(conn)
        };

        let conn = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                ScraperError::CacheBackend(format!("Timed out connecting to Redis after {:?}", timeout))
            })?
            .map_err(|e| ScraperError::CacheBackend(format!("Redis connection error: {}", e)))?;

        Ok(Self { conn, namespace })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                error!(key = key, error = %e, "Redis get error");
                return None;
            }
        };

        match serde_json::from_str(&raw?) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(key = key, error = %e, "Redis value is not valid JSON");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let payload = value.to_string();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut conn = self.conn.clone();

        match redis::cmd("PSETEX")
            .arg(self.key(key))
            .arg(ttl_ms)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(key = key, error = %e, "Redis set error");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<i64>(&mut conn)
            .await
        {
            Ok(removed) => removed > 0,
            Err(e) => {
                error!(key = key, error = %e, "Redis delete error");
                false
            }
        }
    }

    /// Every key currently stored under this namespace
    async fn namespace_keys(&self) -> redis::RedisResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.namespace);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    pub async fn clear(&self) -> bool {
        let keys = match self.namespace_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                error!(namespace = %self.namespace, error = %e, "Redis scan error");
                return false;
            }
        };

        let mut conn = self.conn.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            if let Err(e) = redis::cmd("DEL").arg(chunk.to_vec()).query_async::<i64>(&mut conn).await {
                error!(namespace = %self.namespace, error = %e, "Redis clear error");
                return false;
            }
        }

        debug!(namespace = %self.namespace, removed = keys.len(), "Redis cache cleared");
        true
    }

    pub async fn entry_count(&self) -> usize {
        match self.namespace_keys().await {
            Ok(keys) => keys.len(),
            Err(e) => {
                error!(namespace = %self.namespace, error = %e, "Redis scan error");
                0
            }
        }
    }
}
