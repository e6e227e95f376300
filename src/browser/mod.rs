//! Browser automation boundary
//!
//! The crawler core never looks inside a browser engine. It talks to two
//! traits:
//! - `BrowserLauncher` starts one instance per pool slot and connects to it
//! - `Browser` drives a connected instance: navigation, clicks, script
//!   evaluation, network idle waits and response hijacking
//!
//! Hijacking is a pattern-to-channel mapping: the core installs a
//! `UrlPattern` together with an `ExchangeSink`, and the backend pushes every
//! matching response (body fully loaded) into that sink as an `Exchange`.
//!
//! Two backends implement the traits:
//! - `CdpLauncher` runs Chrome over the DevTools protocol and supports
//!   everything, including actions and hijacking of any page traffic
//! - `HttpLauncher` is a static-fetch backend built on reqwest. It supports
//!   navigation and hijacking of the navigated response; interactive actions
//!   are reported as unsupported, so configurations using it may not declare
//!   actions

mod cdp;
mod http;
mod pattern;
mod routes;

pub use cdp::{CdpBrowser, CdpLauncher};
pub use http::{HttpBrowser, HttpLauncher};
pub use pattern::UrlPattern;
pub use routes::RouteTable;

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by browser backends
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser instance {instance}: {message}")]
    Launch { instance: usize, message: String },

    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("No element matches {0}")]
    ElementNotFound(String),

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Route error: {0}")]
    Route(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Browser instance is closed")]
    Closed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Launch parameters for one pool slot
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Slot number, starting at zero
    pub id: usize,

    /// Persistent state directory owned exclusively by this instance
    pub user_data_dir: PathBuf,

    pub headless: bool,

    pub user_agent: Option<String>,

    /// Remote debugging port for this instance (base port + slot)
    pub remote_debugging_port: u16,
}

/// Address of a launched instance, handed back to `connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHandle {
    pub instance_id: usize,

    /// Backend-specific address (a DevTools URL for CDP engines, the state
    /// directory for the HTTP backend)
    pub endpoint: String,
}

/// Identifier of an installed hijack route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub u64);

/// A hijacked response, tagged with the route that matched it
#[derive(Debug, Clone)]
pub struct Exchange {
    pub route: RouteId,
    pub url: String,
    pub body: Vec<u8>,
}

/// Channel a backend pushes matching exchanges into
pub type ExchangeSink = mpsc::Sender<Exchange>;

/// Starts and connects browser instances
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launches one instance and returns where to reach it
    async fn launch(&self, config: &InstanceConfig) -> Result<ControlHandle, BrowserError>;

    /// Connects to a launched instance
    async fn connect(&self, handle: &ControlHandle) -> Result<Box<dyn Browser>, BrowserError>;
}

/// One connected browser instance
#[async_trait]
pub trait Browser: Send + Sync {
    /// Navigates the page and waits for the load to settle
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Clicks the first element matching a CSS selector
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Clicks the first element matching an XPath expression
    async fn click_xpath(&self, selector: &str) -> Result<(), BrowserError>;

    /// Evaluates a script with arguments and returns its JSON result
    async fn evaluate(&self, script: &str, args: &[Value]) -> Result<Value, BrowserError>;

    /// URL of the current page
    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Routes every response matching `pattern` into `sink`
    async fn install_route(
        &self,
        pattern: &UrlPattern,
        sink: ExchangeSink,
    ) -> Result<RouteId, BrowserError>;

    /// Removes a route and drops its sink
    async fn remove_route(&self, id: RouteId) -> Result<(), BrowserError>;

    /// Waits until no request matching `include` (and not `exclude`) has been
    /// in flight for `quiet`
    async fn wait_network_idle(
        &self,
        quiet: Duration,
        include: &[String],
        exclude: &[String],
    ) -> Result<(), BrowserError>;

    /// Terminates the instance
    async fn close(&self) -> Result<(), BrowserError>;
}
