//! Scraper runtime core.
//!
//! Reusable plumbing for data scrapers: a TTL cache, sliding-window rate
//! limiting with an adaptive variant, a retrying HTTP executor, and a manager
//! that gives each (scraper type, source) pair its own isolated instance.

pub mod api;
pub mod cache;
pub mod error;
pub mod manager;
pub mod runtime;
pub mod scraper;

pub use api::{HttpResponse, Limiter, RateLimiter, Request, RequestExecutor};
pub use cache::{CacheStats, CacheStore};
pub use error::{Result, ScraperError};
pub use manager::{InstanceKey, ManagerStats, ScraperManager};
pub use runtime::{InstanceStats, RuntimeOptions, ScraperRuntime};
pub use scraper::{EndpointScraper, Scraper};
