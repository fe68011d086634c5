//! Registry of scraper runtimes keyed by (scraper type, source).
//!
//! Each pair gets its own cache and rate-limit state, built on first use and
//! shared by every caller until [`ScraperManager::close_all`].

use crate::error::{Result, ScraperError};
use crate::runtime::{InstanceStats, RuntimeOptions, ScraperRuntime};
use serde::Serialize;
use shared::{Config, ScraperTypeConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub scraper_type: String,
    pub source: String,
}

impl InstanceKey {
    pub fn new(scraper_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            scraper_type: scraper_type.into(),
            source: source.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scraper_type, self.source)
    }
}

/// Manager-wide snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active_instances: usize,
    pub active_sources: BTreeMap<String, String>,
    pub instances: Vec<InstanceStats>,
}

pub struct ScraperManager {
    config: Arc<Config>,
    options: RuntimeOptions,
    /// Cells are registered before their runtime is built, so the lock is
    /// never held across construction
    instances: Mutex<HashMap<InstanceKey, Arc<OnceCell<Arc<ScraperRuntime>>>>>,
    /// Source used by `get` when the caller names none
    active_sources: RwLock<HashMap<String, String>>,
}

impl ScraperManager {
    pub fn new(config: Config) -> Self {
        Self::with_options(config, RuntimeOptions::default())
    }

    pub fn with_options(config: Config, options: RuntimeOptions) -> Self {
        let active_sources = config
            .scrapers
            .iter()
            .map(|(scraper_type, type_config)| (scraper_type.clone(), type_config.default_source.clone()))
            .collect();

        info!(
            scraper_types = config.scrapers.len(),
            cache_enabled = options.cache_enabled,
            rate_limit_enabled = options.rate_limit_enabled,
            "Scraper manager initialized"
        );

        Self {
            config: Arc::new(config),
            options,
            instances: Mutex::new(HashMap::new()),
            active_sources: RwLock::new(active_sources),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn type_config(&self, scraper_type: &str) -> Result<&ScraperTypeConfig> {
        self.config
            .scraper(scraper_type)
            .ok_or_else(|| ScraperError::UnknownScraperType(scraper_type.to_string()))
    }

    fn validate_source(&self, scraper_type: &str, source: &str) -> Result<()> {
        let type_config = self.type_config(scraper_type)?;
        if type_config.has_source(source) {
            Ok(())
        } else {
            Err(ScraperError::UnknownSource {
                scraper_type: scraper_type.to_string(),
                source_name: source.to_string(),
                available: type_config.source_names(),
            })
        }
    }

    /// Get the runtime for `scraper_type`, building it on first use.
    ///
    /// Without an explicit `source` the type's active source is used.
    pub async fn get(&self, scraper_type: &str, source: Option<&str>) -> Result<Arc<ScraperRuntime>> {
        let source = match source {
            Some(source) => source.to_string(),
            None => self.active_source(scraper_type)?,
        };
        self.validate_source(scraper_type, &source)?;

        let key = InstanceKey::new(scraper_type, source);
        let config = self.config.as_ref();
        let options = self.options;

        loop {
            let cell = {
                let mut instances = self.instances.lock().await;
                Arc::clone(instances.entry(key.clone()).or_default())
            };

            let key_ref = &key;
            let runtime = cell
                .get_or_try_init(move || async move {
                    let runtime =
                        ScraperRuntime::new(config, &key_ref.scraper_type, &key_ref.source, options)
                            .await?;
                    info!(instance = %key_ref, "Created new scraper instance");
                    Ok::<_, ScraperError>(Arc::new(runtime))
                })
                .await?;

            // close_all may have dropped the cell while the runtime was built
            let registered = self
                .instances
                .lock()
                .await
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell));
            if registered {
                return Ok(Arc::clone(runtime));
            }
            if let Err(e) = runtime.close() {
                debug!(instance = %key, error = %e, "Discarded instance was already closed");
            }
        }
    }

    /// Built runtimes, sorted by key
    async fn live_instances(&self) -> Vec<(InstanceKey, Arc<ScraperRuntime>)> {
        let mut live: Vec<_> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .filter_map(|(key, cell)| cell.get().map(|runtime| (key.clone(), Arc::clone(runtime))))
                .collect()
        };
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    /// Change the default source for a type. Unknown sources leave it untouched.
    pub fn switch_source(&self, scraper_type: &str, source: &str) -> Result<()> {
        self.validate_source(scraper_type, source)?;

        let previous = self
            .active_sources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(scraper_type.to_string(), source.to_string());

        info!(
            scraper_type = scraper_type,
            from = previous.as_deref().unwrap_or("none"),
            to = source,
            "Switched data source"
        );
        Ok(())
    }

    pub fn active_source(&self, scraper_type: &str) -> Result<String> {
        let type_config = self.type_config(scraper_type)?;
        let active = self
            .active_sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(scraper_type)
            .cloned();
        Ok(active.unwrap_or_else(|| type_config.default_source.clone()))
    }

    pub fn available_sources(&self, scraper_type: &str) -> Result<Vec<String>> {
        Ok(self.type_config(scraper_type)?.source_names())
    }

    /// Invalidate cache on every live instance matching the filters.
    ///
    /// `None` filters match everything; `key` deletes a single entry instead
    /// of clearing. Returns how many instances were touched.
    pub async fn invalidate_cache(
        &self,
        scraper_type: Option<&str>,
        source: Option<&str>,
        key: Option<&str>,
    ) -> usize {
        let targets: Vec<_> = self
            .live_instances()
            .await
            .into_iter()
            .filter(|(k, _)| scraper_type.map_or(true, |t| k.scraper_type == t))
            .filter(|(k, _)| source.map_or(true, |s| k.source == s))
            .collect();

        for (_, runtime) in &targets {
            runtime.invalidate(key).await;
        }

        info!(
            scraper_type = scraper_type.unwrap_or("*"),
            source = source.unwrap_or("*"),
            key = key.unwrap_or("*"),
            instances = targets.len(),
            "Cache invalidated"
        );
        targets.len()
    }

    pub async fn stats(&self) -> ManagerStats {
        let runtimes = self.live_instances().await;

        let mut instances = Vec::with_capacity(runtimes.len());
        for (_, runtime) in &runtimes {
            instances.push(runtime.stats().await);
        }

        let active_sources = self
            .active_sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(t, s)| (t.clone(), s.clone()))
            .collect();

        ManagerStats {
            active_instances: instances.len(),
            active_sources,
            instances,
        }
    }

    /// Close and forget every instance. Safe to call repeatedly.
    ///
    /// A failing close is logged and does not stop the others.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(InstanceKey, Arc<ScraperRuntime>)> = {
            let mut instances = self.instances.lock().await;
            instances
                .drain()
                .filter_map(|(key, cell)| cell.get().map(|runtime| (key, Arc::clone(runtime))))
                .collect()
        };

        if drained.is_empty() {
            return 0;
        }

        let mut closed = 0;
        for (key, runtime) in drained {
            match runtime.close() {
                Ok(()) => closed += 1,
                Err(e) => {
                    let error = ScraperError::InstanceClose {
                        key: key.to_string(),
                        reason: e.to_string(),
                    };
                    error!(error = %error, "Error closing scraper instance");
                }
            }
        }

        if closed > 0 {
            info!(closed = closed, "All scraper instances closed");
        } else {
            warn!("No scraper instance closed cleanly");
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn seed(runtime: &ScraperRuntime, key: &str) {
        let _: Value = runtime
            .fetch_with_cache(key, None, || async { Ok(json!({"seeded": true})) })
            .await
            .unwrap();
    }

    async fn entries(runtime: &ScraperRuntime) -> usize {
        runtime.stats().await.cache.unwrap().entries
    }

    #[tokio::test]
    async fn test_instances_are_reused() {
        let manager = ScraperManager::new(Config::default());

        let first = manager.get("foolsball", None).await.unwrap();
        let second = manager.get("foolsball", Some("espn")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            first.rate_limiter().unwrap(),
            second.rate_limiter().unwrap()
        ));

        let nfl = manager.get("foolsball", Some("nfl")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &nfl));
        assert_eq!(manager.stats().await.active_instances, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_get_builds_one_instance() {
        let manager = ScraperManager::new(Config::default());

        let (a, b) = tokio::join!(manager.get("jobs", None), manager.get("jobs", None));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(manager.stats().await.active_instances, 1);
    }

    #[cfg(feature = "redis-backend")]
    #[tokio::test]
    async fn test_slow_instance_build_does_not_block_registry() {
        // Accepts connections but never answers, so the Redis handshake stalls
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let stalled = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut config = Config::default();
        config.cache.backend = shared::CacheBackendKind::Redis;
        config.cache.redis_url = format!("redis://{}/0", address);
        config.cache.connect_timeout_secs = 1;

        let manager = Arc::new(ScraperManager::new(config));
        let building = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get("jobs", None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = tokio::time::timeout(Duration::from_millis(300), manager.stats())
            .await
            .expect("stats blocked behind instance construction");
        assert_eq!(stats.active_instances, 0);

        let runtime = building.await.unwrap().unwrap();
        assert_eq!(runtime.stats().await.cache.unwrap().backend, "memory");
        assert_eq!(manager.stats().await.active_instances, 1);
        stalled.abort();
    }

    #[tokio::test]
    async fn test_unknown_type_and_source() {
        let manager = ScraperManager::new(Config::default());

        assert!(matches!(
            manager.get("curling", None).await,
            Err(ScraperError::UnknownScraperType(_))
        ));
        assert!(matches!(
            manager.get("foolsball", Some("yahoo")).await,
            Err(ScraperError::UnknownSource { .. })
        ));
        assert!(manager.available_sources("curling").is_err());
    }

    #[tokio::test]
    async fn test_switch_source() {
        let manager = ScraperManager::new(Config::default());
        assert_eq!(manager.active_source("foolsball").unwrap(), "espn");
        assert_eq!(
            manager.available_sources("foolsball").unwrap(),
            vec!["espn".to_string(), "nfl".to_string()]
        );

        manager.switch_source("foolsball", "nfl").unwrap();
        assert_eq!(manager.active_source("foolsball").unwrap(), "nfl");
        assert_eq!(manager.get("foolsball", None).await.unwrap().source(), "nfl");

        let error = manager.switch_source("foolsball", "yahoo").unwrap_err();
        match error {
            ScraperError::UnknownSource {
                source_name,
                available,
                ..
            } => {
                assert_eq!(source_name, "yahoo");
                assert_eq!(available.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.active_source("foolsball").unwrap(), "nfl");
    }

    #[tokio::test]
    async fn test_invalidation_granularity() {
        let manager = ScraperManager::new(Config::default());
        let espn = manager.get("foolsball", Some("espn")).await.unwrap();
        let nfl = manager.get("foolsball", Some("nfl")).await.unwrap();
        let jobs = manager.get("jobs", None).await.unwrap();

        for runtime in [&espn, &nfl, &jobs] {
            seed(runtime, "a").await;
            seed(runtime, "b").await;
        }

        // Single key on one instance
        assert_eq!(manager.invalidate_cache(Some("foolsball"), Some("espn"), Some("a")).await, 1);
        assert_eq!(entries(&espn).await, 1);
        assert_eq!(entries(&nfl).await, 2);

        // Whole type
        assert_eq!(manager.invalidate_cache(Some("foolsball"), None, None).await, 2);
        assert_eq!(entries(&espn).await, 0);
        assert_eq!(entries(&nfl).await, 0);
        assert_eq!(entries(&jobs).await, 2);

        // Everything
        assert_eq!(manager.invalidate_cache(None, None, None).await, 3);
        assert_eq!(entries(&jobs).await, 0);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let manager = ScraperManager::new(Config::default());
        manager.get("jobs", None).await.unwrap();
        manager.get("foolsball", None).await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.active_instances, 2);
        assert_eq!(stats.active_sources.get("jobs").map(String::as_str), Some("jsearch"));
        assert_eq!(stats.instances[0].scraper_type, "foolsball");
        assert!(stats.instances[0].rate_limiter.as_ref().unwrap().adaptive.is_some());
        assert!(stats.instances[1].rate_limiter.as_ref().unwrap().adaptive.is_none());
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let manager = ScraperManager::new(Config::default());
        assert_eq!(manager.close_all().await, 0);

        let runtime = manager.get("foolsball", None).await.unwrap();
        assert_eq!(manager.close_all().await, 1);
        assert!(runtime.is_closed());
        assert_eq!(manager.close_all().await, 0);
        assert_eq!(manager.stats().await.active_instances, 0);

        // A fresh instance is built after shutdown
        let rebuilt = manager.get("foolsball", None).await.unwrap();
        assert!(!rebuilt.is_closed());
        assert!(!Arc::ptr_eq(&runtime, &rebuilt));
    }

    #[tokio::test]
    async fn test_close_all_continues_past_failures() {
        let manager = ScraperManager::new(Config::default());
        let espn = manager.get("foolsball", Some("espn")).await.unwrap();
        manager.get("foolsball", Some("nfl")).await.unwrap();

        espn.close().unwrap();
        assert_eq!(manager.close_all().await, 1);
        assert_eq!(manager.stats().await.active_instances, 0);
    }

    #[tokio::test]
    async fn test_disabled_layers_propagate() {
        let options = RuntimeOptions {
            cache_enabled: false,
            rate_limit_enabled: true,
        };
        let manager = ScraperManager::with_options(Config::default(), options);
        let runtime = manager.get("jobs", None).await.unwrap();

        assert!(!runtime.cache_enabled());
        assert!(runtime.rate_limit_enabled());
        assert_eq!(manager.invalidate_cache(None, None, None).await, 1);
    }
}
