//! Configuration module for Siphon
//!
//! This module handles loading, parsing, and validating TOML configuration
//! files, and turns `[[job]]` tables into crawl jobs.
//!
//! # Example
//!
//! ```no_run
//! use siphon::config::{build_jobs, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new("siphon.toml")).unwrap();
//! let jobs = build_jobs(&config.jobs, config.pipeline.channel_capacity);
//! println!("{} jobs on {} browsers", jobs.len(), config.browser.pool_size);
//! ```

mod jobs;
mod parser;
mod types;
mod validation;

pub use jobs::{build_jobs, ActionEntry, ConverterEntry, InterceptEntry, JobEntry};
pub use types::{
    BrowserBackend, BrowserConfig, Config, EmbeddingConfig, IndexingConfig, PipelineConfig,
    SchedulerConfig,
};
pub use validation::MAX_POOL_SIZE;

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
