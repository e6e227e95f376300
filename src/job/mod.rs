//! Crawl job data model
//!
//! A crawl job is a target URL, the actions to play back on it in order, and
//! the interception rules that route matching network exchanges to outputs.
//!
//! # Example
//!
//! ```no_run
//! use siphon::job::{Action, CrawlJob, InterceptRule, OutputRoute};
//! use std::time::Duration;
//!
//! let job = CrawlJob::new("https://example.com/listings")
//!     .with_action(Action::scroll(1200, Duration::from_millis(500)))
//!     .with_intercept(InterceptRule::new("*api/listings*", OutputRoute::observe("listings")));
//! assert!(job.validate().is_ok());
//! ```

mod action;
mod payload;
mod rule;

pub use action::{Action, ActionError};
pub(crate) use action::SCROLL_SCRIPT;
pub use payload::CapturedPayload;
pub use rule::{InterceptRule, OutputRoute, DEFAULT_CHANNEL_CAPACITY};

/// One target URL plus its ordered actions and interception rules
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub url: String,
    pub actions: Vec<Action>,
    pub intercepts: Vec<InterceptRule>,
}

impl CrawlJob {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            actions: Vec::new(),
            intercepts: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_intercept(mut self, rule: InterceptRule) -> Self {
        self.intercepts.push(rule);
        self
    }

    /// Validates every action, reporting the first failure with its position
    pub fn validate(&self) -> Result<(), (usize, ActionError)> {
        for (index, action) in self.actions.iter().enumerate() {
            action.validate().map_err(|e| (index, e))?;
        }
        Ok(())
    }
}
