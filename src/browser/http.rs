//! Static-fetch browser backend
//!
//! Each instance owns its own reqwest client and state directory, so two
//! instances never share connections or cookies. Navigation is a GET; the
//! loaded response is offered to every installed route whose pattern matches
//! the requested or final URL. There is no DOM, so clicks and scripts are
//! reported as unsupported, and the network is idle as soon as navigation
//! returns.

use crate::browser::{
    Browser, BrowserError, BrowserLauncher, ControlHandle, ExchangeSink, InstanceConfig,
    RouteId, RouteTable, UrlPattern,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// User agent sent when the instance config does not set one
pub const DEFAULT_USER_AGENT: &str = concat!("siphon/", env!("CARGO_PKG_VERSION"));

/// Launches `HttpBrowser` instances
pub struct HttpLauncher {
    request_timeout: Duration,
    launched: Mutex<HashMap<usize, Client>>,
}

impl HttpLauncher {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            launched: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for HttpLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Builds the HTTP client for one instance
///
/// # Arguments
///
/// * `config` - The instance configuration (user agent)
/// * `timeout` - Whole-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &InstanceConfig, timeout: Duration) -> Result<Client, reqwest::Error> {
    let user_agent = config
        .user_agent
        .clone()
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

#[async_trait]
impl BrowserLauncher for HttpLauncher {
    async fn launch(&self, config: &InstanceConfig) -> Result<ControlHandle, BrowserError> {
        tokio::fs::create_dir_all(&config.user_data_dir).await?;

        let client =
            build_http_client(config, self.request_timeout).map_err(|e| BrowserError::Launch {
                instance: config.id,
                message: e.to_string(),
            })?;

        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.id, client);

        Ok(ControlHandle {
            instance_id: config.id,
            endpoint: config.user_data_dir.display().to_string(),
        })
    }

    async fn connect(&self, handle: &ControlHandle) -> Result<Box<dyn Browser>, BrowserError> {
        let client = self
            .launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.instance_id)
            .ok_or_else(|| BrowserError::Connect {
                endpoint: handle.endpoint.clone(),
                message: "instance was not launched or is already connected".to_string(),
            })?;

        Ok(Box::new(HttpBrowser::new(client)))
    }
}

/// A connected static-fetch instance
pub struct HttpBrowser {
    client: Client,
    routes: RouteTable,
    current_url: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpBrowser {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            routes: RouteTable::new(),
            current_url: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;

        let response = self.client.get(url).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                "request timeout".to_string()
            } else if e.is_connect() {
                "connection refused".to_string()
            } else {
                e.to_string()
            };
            BrowserError::Navigation {
                url: url.to_string(),
                message,
            }
        })?;

        let status = response.status();
        let final_url = response.url().to_string();

        if !status.is_success() {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let body = response.bytes().await.map_err(|e| BrowserError::Navigation {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        *self
            .current_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(final_url.clone());

        let mut delivered = self.routes.deliver(&final_url, &body).await;
        if final_url != url && delivered == 0 {
            delivered = self.routes.deliver(url, &body).await;
        }

        tracing::debug!(
            "Loaded {} ({} bytes, delivered to {} routes)",
            final_url,
            body.len(),
            delivered
        );
        Ok(())
    }

    async fn click(&self, _selector: &str) -> Result<(), BrowserError> {
        Err(BrowserError::Unsupported("click"))
    }

    async fn click_xpath(&self, _selector: &str) -> Result<(), BrowserError> {
        Err(BrowserError::Unsupported("click by XPath"))
    }

    async fn evaluate(&self, _script: &str, _args: &[Value]) -> Result<Value, BrowserError> {
        Err(BrowserError::Unsupported("script evaluation"))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.ensure_open()?;
        Ok(self
            .current_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn install_route(
        &self,
        pattern: &UrlPattern,
        sink: ExchangeSink,
    ) -> Result<RouteId, BrowserError> {
        self.ensure_open()?;
        Ok(self.routes.install(pattern.clone(), sink))
    }

    async fn remove_route(&self, id: RouteId) -> Result<(), BrowserError> {
        if self.routes.remove(id) {
            Ok(())
        } else {
            Err(BrowserError::Route(format!("route {:?} is not installed", id)))
        }
    }

    async fn wait_network_idle(
        &self,
        _quiet: Duration,
        _include: &[String],
        _exclude: &[String],
    ) -> Result<(), BrowserError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.routes.clear();
        }
        Ok(())
    }
}
