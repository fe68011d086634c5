//! Outbound request plumbing.
//!
//! This module provides a rate-limited, retry-enabled executor together with
//! the sliding-log limiters it consults before every attempt.

pub mod executor;
pub mod rate_limiter;
pub mod types;

pub use executor::{ExecutorSettings, RequestExecutor};
pub use rate_limiter::{
    AdaptiveRateLimiter, AdaptiveSettings, AdaptiveStats, Limiter, RateLimiter, RateLimiterStats,
};
pub use types::{HttpResponse, Request};
