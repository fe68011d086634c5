//! Shared library for the scraper runtime workspace.
//!
//! This crate provides common functionality used across the workspace:
//! - Configuration management
//! - Logging infrastructure

pub mod config;
pub mod logging;

// Re-export commonly used types
pub use config::{
    CacheBackendKind, CacheConfig, Config, RateLimitConfig, RequestConfig, ScraperTypeConfig,
    TtlTable,
};
pub use logging::LogConfig;
