//! Error types for the scraper runtime.

use reqwest::StatusCode;
use thiserror::Error;

/// Result alias used throughout the runtime
pub type Result<T> = std::result::Result<T, ScraperError>;

/// Errors surfaced by the cache, executor, runtime and manager.
#[derive(Error, Debug)]
pub enum ScraperError {
    /// External cache backend could not be built. Only ever logged; the
    /// cache downgrades to memory instead of returning this.
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Upstream answered 429 and retries were exhausted.
    #[error("Rate limit exceeded: {url}")]
    RateLimited { url: String },

    /// Upstream answered with a non-2xx status.
    #[error("HTTP {status} from {url}: {body}")]
    Upstream {
        url: String,
        status: StatusCode,
        body: String,
    },

    /// Connection failure or timeout after retries were exhausted.
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Source is not registered for the scraper type.
    #[error("Unknown source '{source_name}' for {scraper_type}. Valid sources: {available:?}")]
    UnknownSource {
        scraper_type: String,
        source_name: String,
        available: Vec<String>,
    },

    #[error("Unknown scraper type: {0}")]
    UnknownScraperType(String),

    /// Endpoint is not defined for the source.
    #[error("Unknown endpoint '{endpoint}' for source {source_name}")]
    UnknownEndpoint {
        source_name: String,
        endpoint: String,
    },

    /// The runtime was closed and can no longer issue requests.
    #[error("Scraper instance {0} is closed")]
    InstanceClosed(String),

    /// An instance failed to close during shutdown.
    #[error("Failed to close scraper instance {key}: {reason}")]
    InstanceClose { key: String, reason: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Building the HTTP client or request failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ScraperError {
    /// Upstream status code, if the error carries one
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ScraperError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            ScraperError::Upstream { status, .. } => Some(*status),
            ScraperError::Transport { source, .. } => source.status(),
            _ => None,
        }
    }
}
