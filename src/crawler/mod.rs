//! Crawler module: running crawl jobs on a bounded browser pool
//!
//! This module contains the orchestration core, including:
//! - The browser pool and its leases
//! - The scheduler and its workers
//! - Per-job network interception
//! - Action playback with settle delays and network idle waits

mod error;
mod executor;
mod interceptor;
mod pool;
mod scheduler;

pub use error::{AggregateError, JobError, JobFailure};
pub use interceptor::{BoundRule, Router, RouterStats};
pub use pool::{BrowserLease, BrowserPool, PoolError};
pub use scheduler::{JobRuntime, Scheduler};
