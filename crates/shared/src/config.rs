//! Configuration management for the scraper runtime.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings
    pub logging: LoggingConfig,

    /// Cache settings shared by every scraper instance
    pub cache: CacheConfig,

    /// Rate limiting settings shared by every scraper instance
    pub rate_limit: RateLimitConfig,

    /// Outbound HTTP settings
    pub request: RequestConfig,

    /// Scraper types keyed by name (e.g. "foolsball", "jobs")
    pub scrapers: BTreeMap<String, ScraperTypeConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log directory path
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Cache backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Process-local map with lazy expiry
    Memory,
    /// External Redis server with native expiry
    Redis,
}

impl std::str::FromStr for CacheBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(anyhow::anyhow!("Unknown cache backend: {}", other)),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable caching
    pub enabled: bool,

    /// Which backend to build at construction time
    pub backend: CacheBackendKind,

    /// Redis connection URL (only used by the redis backend)
    pub redis_url: String,

    /// Prefix for every key written to Redis
    pub key_prefix: String,

    /// How long to wait for Redis before falling back to memory
    pub connect_timeout_secs: u64,

    /// Default TTL per data kind, in seconds
    pub ttl: TtlTable,
}

/// Per-data-kind TTL table.
///
/// `default` applies to any kind that has no entry of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlTable {
    #[serde(default = "default_ttl_secs")]
    pub default: u64,

    #[serde(flatten)]
    pub kinds: BTreeMap<String, u64>,
}

fn default_ttl_secs() -> u64 {
    3_600
}

impl TtlTable {
    /// TTL for a data kind, falling back to the default entry
    pub fn ttl_for(&self, kind: &str) -> Duration {
        Duration::from_secs(self.kinds.get(kind).copied().unwrap_or(self.default))
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default)
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        let mut kinds = BTreeMap::new();
        // Team data changes infrequently
        kinds.insert("team_data".to_string(), 86_400);
        // Player data updates frequently
        kinds.insert("player_data".to_string(), 300);
        kinds.insert("job_data".to_string(), 3_600);

        Self {
            default: default_ttl_secs(),
            kinds,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Maximum calls inside one sliding window
    pub max_calls: u32,

    /// Window length in seconds
    pub period_secs: u64,

    /// Multiplier applied to the limit after an error streak
    pub backoff_factor: f64,

    /// Multiplier applied to the limit after a success streak
    pub recovery_factor: f64,

    /// Consecutive errors that trigger a backoff
    pub error_threshold: u32,

    /// Consecutive successes that trigger a recovery step
    pub success_threshold: u32,

    /// Grow by at least one call per recovery step, so limits below
    /// 1 / (recovery_factor - 1) can still recover
    pub recovery_min_step: bool,
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Outbound request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// User-Agent header sent with every request
    pub user_agent: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retries for failed requests
    pub max_retries: u32,

    /// Base retry delay in milliseconds (exponential backoff)
    pub retry_delay_ms: u64,
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One scraper type and the sources it can talk to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperTypeConfig {
    /// Source used when a caller does not name one
    pub default_source: String,

    /// Use the adaptive rate limiter for this type
    #[serde(default)]
    pub adaptive: bool,

    /// Overrides `rate_limit.max_calls` for this type
    #[serde(default)]
    pub max_calls: Option<u32>,

    /// Overrides `rate_limit.period_secs` for this type
    #[serde(default)]
    pub period_secs: Option<u64>,

    /// Extra headers sent with every request of this type
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Known sources, each mapping endpoint names to URL templates
    pub sources: BTreeMap<String, BTreeMap<String, String>>,
}

impl ScraperTypeConfig {
    /// Names of all known sources for this type
    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            default_level: "info".to_string(),
            console: true,
            file: false,
            json_format: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            redis_url: "redis://localhost:6379/0".to_string(),
            key_prefix: "scraper".to_string(),
            connect_timeout_secs: 2,
            ttl: TtlTable::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_calls: 10,
            period_secs: 60,
            backoff_factor: 0.5,
            recovery_factor: 1.1,
            error_threshold: 3,
            success_threshold: 5,
            recovery_min_step: false,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 2_000,
        }
    }
}

fn endpoints(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, url)| (name.to_string(), url.to_string()))
        .collect()
}

fn default_scrapers() -> BTreeMap<String, ScraperTypeConfig> {
    let mut foolsball_sources = BTreeMap::new();
    foolsball_sources.insert(
        "espn".to_string(),
        endpoints(&[
            ("teams", "https://site.api.espn.com/apis/site/v2/sports/football/nfl/teams"),
            ("scoreboard", "https://site.api.espn.com/apis/site/v2/sports/football/nfl/scoreboard"),
            (
                "player_stats",
                "https://sports.core.api.espn.com/v2/sports/football/leagues/nfl/athletes/{player_id}",
            ),
        ]),
    );
    foolsball_sources.insert(
        "nfl".to_string(),
        endpoints(&[
            ("teams", "https://api.nfl.com/v3/shield/teams"),
            ("players", "https://api.nfl.com/v3/shield/players"),
        ]),
    );

    let mut jobs_sources = BTreeMap::new();
    jobs_sources.insert(
        "jsearch".to_string(),
        endpoints(&[("search", "https://jsearch.p.rapidapi.com/search")]),
    );

    let mut jobs_headers = BTreeMap::new();
    jobs_headers.insert("X-RapidAPI-Host".to_string(), "jsearch.p.rapidapi.com".to_string());

    let mut scrapers = BTreeMap::new();
    scrapers.insert(
        "foolsball".to_string(),
        ScraperTypeConfig {
            default_source: "espn".to_string(),
            adaptive: true,
            max_calls: None,
            period_secs: None,
            headers: BTreeMap::new(),
            sources: foolsball_sources,
        },
    );
    scrapers.insert(
        "jobs".to_string(),
        ScraperTypeConfig {
            default_source: "jsearch".to_string(),
            adaptive: false,
            max_calls: None,
            period_secs: None,
            headers: jobs_headers,
            sources: jobs_sources,
        },
    );
    scrapers
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            request: RequestConfig::default(),
            scrapers: default_scrapers(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load configuration from a TOML file or create default if not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::from_file(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Apply `SCRAPER_CACHE_BACKEND`, `REDIS_URL` and `LOG_LEVEL` from the environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(backend) = lookup("SCRAPER_CACHE_BACKEND") {
            self.cache.backend = backend
                .parse()
                .context("Invalid SCRAPER_CACHE_BACKEND")?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.cache.redis_url = url;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.default_level = level.to_ascii_lowercase();
        }
        Ok(())
    }

    /// Look up a scraper type by name
    pub fn scraper(&self, scraper_type: &str) -> Option<&ScraperTypeConfig> {
        self.scrapers.get(scraper_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.rate_limit.max_calls, 10);
        assert_eq!(config.rate_limit.period_secs, 60);
        assert_eq!(config.rate_limit.backoff_factor, 0.5);
        assert_eq!(config.rate_limit.recovery_factor, 1.1);
        assert_eq!(config.rate_limit.error_threshold, 3);
        assert_eq!(config.rate_limit.success_threshold, 5);
        assert!(!config.rate_limit.recovery_min_step);
        assert_eq!(config.request.max_retries, 3);
        assert_eq!(config.scraper("foolsball").unwrap().default_source, "espn");
    }

    #[test]
    fn test_ttl_table() {
        let ttl = TtlTable::default();
        assert_eq!(ttl.ttl_for("team_data"), Duration::from_secs(86_400));
        assert_eq!(ttl.ttl_for("player_data"), Duration::from_secs(300));
        assert_eq!(ttl.ttl_for("something_else"), Duration::from_secs(3_600));
        assert_eq!(ttl.default_ttl(), Duration::from_secs(3_600));
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let saved_config = Config::default();
        saved_config.save(&config_path)?;

        assert!(config_path.exists());

        let loaded_config = Config::from_file(&config_path)?;
        assert_eq!(loaded_config.cache.ttl.ttl_for("team_data"), Duration::from_secs(86_400));
        assert_eq!(
            loaded_config.scraper("foolsball").unwrap().source_names(),
            vec!["espn".to_string(), "nfl".to_string()]
        );
        assert_eq!(
            loaded_config.request.user_agent,
            saved_config.request.user_agent
        );

        Ok(())
    }

    #[test]
    fn test_partial_config_uses_defaults() -> Result<()> {
        let config: Config = toml::from_str(
            r#"
            [rate_limit]
            max_calls = 3

            [cache]
            backend = "redis"
            "#,
        )?;

        assert_eq!(config.rate_limit.max_calls, 3);
        assert_eq!(config.rate_limit.period_secs, 60);
        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert!(config.cache.enabled);
        assert!(config.scraper("jobs").is_some());
        Ok(())
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        // Should return default config without error
        assert_eq!(config.request.timeout_secs, 30);
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "SCRAPER_CACHE_BACKEND" => Some("Redis".to_string()),
            "REDIS_URL" => Some("redis://cache:6380/1".to_string()),
            _ => None,
        })?;

        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.cache.redis_url, "redis://cache:6380/1");
        assert_eq!(config.logging.default_level, "info");

        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "SCRAPER_CACHE_BACKEND").then(|| "memcached".to_string())
        });
        assert!(result.is_err());
        Ok(())
    }
}
