//! Per-instance runtime: one cache, one limiter and one executor for a
//! (scraper type, source) pair.

use crate::api::{ExecutorSettings, HttpResponse, Limiter, RateLimiterStats, Request, RequestExecutor};
use crate::cache::{CacheStats, CacheStore};
use crate::error::{Result, ScraperError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{Config, TtlTable};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Which layers a runtime is built with
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub cache_enabled: bool,
    pub rate_limit_enabled: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            rate_limit_enabled: true,
        }
    }
}

/// Snapshot of one runtime for stats output
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub scraper_type: String,
    pub source: String,
    pub cache_enabled: bool,
    pub rate_limit_enabled: bool,
    pub cache: Option<CacheStats>,
    pub rate_limiter: Option<RateLimiterStats>,
    pub created_at: DateTime<Utc>,
    pub closed: bool,
}

pub struct ScraperRuntime {
    scraper_type: String,
    source: String,
    cache: Option<CacheStore>,
    executor: RequestExecutor,
    ttl: TtlTable,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl ScraperRuntime {
    /// Build a runtime for `scraper_type` talking to `source`.
    ///
    /// Limits come from `[rate_limit]` unless the type overrides them. The
    /// cache backend is resolved here and never changes afterwards.
    pub async fn new(
        config: &Config,
        scraper_type: &str,
        source: &str,
        options: RuntimeOptions,
    ) -> Result<Self> {
        let type_config = config
            .scraper(scraper_type)
            .ok_or_else(|| ScraperError::UnknownScraperType(scraper_type.to_string()))?;

        if !type_config.has_source(source) {
            return Err(ScraperError::UnknownSource {
                scraper_type: scraper_type.to_string(),
                source_name: source.to_string(),
                available: type_config.source_names(),
            });
        }

        let name = format!("{}:{}", scraper_type, source);

        let cache = if options.cache_enabled && config.cache.enabled {
            Some(CacheStore::from_config(&config.cache, &name).await)
        } else {
            None
        };

        let limiter = if options.rate_limit_enabled && config.rate_limit.enabled {
            let max_calls = type_config.max_calls.unwrap_or(config.rate_limit.max_calls);
            let period = type_config
                .period_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.rate_limit.period());
            Some(Arc::new(Limiter::from_config(
                &config.rate_limit,
                max_calls,
                period,
                type_config.adaptive,
            )))
        } else {
            None
        };

        let mut settings = ExecutorSettings::from(&config.request);
        settings.headers = type_config
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let executor = RequestExecutor::new(name.clone(), settings, limiter)?;

        info!(
            instance = %name,
            cache = cache.as_ref().map(|c| c.backend_name()).unwrap_or("disabled"),
            rate_limit = executor.limiter().map(|l| l.max_calls()),
            adaptive = type_config.adaptive,
            "Scraper runtime initialized"
        );

        Ok(Self {
            scraper_type: scraper_type.to_string(),
            source: source.to_string(),
            cache,
            executor,
            ttl: config.cache.ttl.clone(),
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn scraper_type(&self) -> &str {
        &self.scraper_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// `type:source`, as used in logs and errors
    pub fn name(&self) -> String {
        format!("{}:{}", self.scraper_type, self.source)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.executor.limiter().is_some()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<Limiter>> {
        self.executor.limiter()
    }

    /// TTL for a data kind such as `team_data`, falling back to the default
    pub fn ttl_for(&self, kind: &str) -> Duration {
        self.ttl.ttl_for(kind)
    }

    /// Deterministic key: `prefix:pos1:pos2:k1=v1:k2=v2`, named parts sorted by name
    pub fn build_cache_key(prefix: &str, positional: &[&dyn Display], named: &[(&str, &dyn Display)]) -> String {
        let mut named: Vec<_> = named.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));

        let mut parts = Vec::with_capacity(1 + positional.len() + named.len());
        parts.push(prefix.to_string());
        parts.extend(positional.iter().map(|arg| arg.to_string()));
        parts.extend(named.iter().map(|(name, value)| format!("{}={}", name, value)));
        parts.join(":")
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ScraperError::InstanceClosed(self.name()));
        }
        Ok(())
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Errors from `fetch` are returned unchanged and never cached. Results
    /// serializing to `null` are returned but not stored.
    pub async fn fetch_with_cache<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;

        match &self.cache {
            Some(cache) => {
                let ttl = ttl.unwrap_or_else(|| self.ttl.default_ttl());
                cache.get_or_set(key, ttl, fetch).await
            }
            None => fetch().await,
        }
    }

    /// Run a request through this runtime's limiter and retry policy
    pub async fn execute(&self, request: &Request) -> Result<HttpResponse> {
        self.ensure_open()?;
        self.executor.execute(request).await
    }

    /// Delete one key, or clear this runtime's cache when `key` is `None`.
    ///
    /// Returns false when caching is disabled or nothing was removed.
    pub async fn invalidate(&self, key: Option<&str>) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };

        match key {
            Some(key) => {
                let removed = cache.delete(key).await;
                info!(instance = %self.name(), key = key, removed = removed, "Cache invalidated");
                removed
            }
            None => {
                let cleared = cache.clear().await;
                info!(instance = %self.name(), "All cache cleared");
                cleared
            }
        }
    }

    /// Release the HTTP connection pool. A second close is an error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ScraperError::InstanceClosed(self.name()));
        }
        self.executor.close();
        info!(instance = %self.name(), "Session closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> InstanceStats {
        let cache = match &self.cache {
            Some(cache) => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(instance = %self.name(), purged = purged, "Purged expired cache entries");
                }
                Some(cache.stats().await)
            }
            None => None,
        };

        InstanceStats {
            scraper_type: self.scraper_type.clone(),
            source: self.source.clone(),
            cache_enabled: self.cache_enabled(),
            rate_limit_enabled: self.rate_limit_enabled(),
            cache,
            rate_limiter: self.rate_limiter().map(|limiter| limiter.stats()),
            created_at: self.created_at,
            closed: self.is_closed(),
        }
    }
}
