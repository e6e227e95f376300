//! Siphon: concurrent browser-driven capture feeding a streaming index
//!
//! This crate multiplexes any number of crawl jobs onto a small, fixed pool of
//! browser instances, turns intercepted network exchanges into typed payloads,
//! and streams those payloads through an embed-and-bulk-index pipeline.

pub mod browser;
pub mod config;
pub mod crawler;
pub mod document;
pub mod embedding;
pub mod job;
pub mod pipeline;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

/// Main error type for Siphon operations
///
/// Component errors (pool, browser, embedding, store, pipeline) are either
/// folded into a failed job or logged per batch, so only configuration and
/// crawl failures reach callers.
#[derive(Debug, Error)]
pub enum SiphonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Crawl failed: {0}")]
    Crawl(#[from] crawler::AggregateError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid URL pattern: {0}")]
    InvalidPattern(String),
}

/// Result type alias for Siphon operations
pub type Result<T> = std::result::Result<T, SiphonError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{AggregateError, BrowserPool, Scheduler};
pub use document::{Document, DocumentConverter};
pub use job::{Action, CapturedPayload, CrawlJob, InterceptRule, OutputRoute};
pub use service::{CrawlOutcome, CrawlService};

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs_from(content: &str) -> Result<Vec<CrawlJob>> {
        let config = config::parse_config(content)?;
        Ok(config::build_jobs(&config.jobs, config.pipeline.channel_capacity))
    }

    #[test]
    fn test_config_errors_surface_as_siphon_errors() {
        let err = jobs_from("[browser]\npool-size = ").unwrap_err();
        assert!(matches!(err, SiphonError::Config(ConfigError::Parse(_))));
        assert!(err.to_string().starts_with("Configuration error:"));
    }
}
