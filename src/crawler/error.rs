use crate::browser::BrowserError;
use crate::crawler::PoolError;
use crate::job::ActionError;
use std::fmt;
use thiserror::Error;

/// Why a single job failed
#[derive(Debug, Error)]
pub enum JobError {
    #[error("action {index} is invalid: {source}")]
    Validation {
        index: usize,
        #[source]
        source: ActionError,
    },

    #[error("no browser available: {0}")]
    Resource(#[source] PoolError),

    #[error("navigation failed: {0}")]
    Navigation(#[source] BrowserError),

    #[error("action {index} ({kind}) failed: {source}")]
    Action {
        index: usize,
        kind: &'static str,
        #[source]
        source: BrowserError,
    },

    #[error("failed to install interception routes: {0}")]
    Route(#[source] BrowserError),

    #[error("cancelled")]
    Cancelled,
}

impl From<PoolError> for JobError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Cancelled => Self::Cancelled,
            other => Self::Resource(other),
        }
    }
}

impl From<(usize, ActionError)> for JobError {
    fn from((index, source): (usize, ActionError)) -> Self {
        Self::Validation { index, source }
    }
}

/// A failed job, identified by its submission position
#[derive(Debug)]
pub struct JobFailure {
    pub index: usize,
    pub url: String,
    pub error: JobError,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} ({}): {}", self.index, self.url, self.error)
    }
}

/// Every job failure of one crawl
///
/// Failures are ordered by job position.
#[derive(Debug)]
pub struct AggregateError {
    pub total: usize,
    pub failures: Vec<JobFailure>,
}

impl AggregateError {
    /// Number of jobs that failed
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether every failure was caused by cancellation
    pub fn only_cancelled(&self) -> bool {
        self.failures
            .iter()
            .all(|failure| matches!(failure.error, JobError::Cancelled))
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} jobs failed", self.failures.len(), self.total)?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
