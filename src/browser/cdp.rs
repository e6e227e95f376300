//! Chrome backend over the DevTools protocol
//!
//! Each pool slot is its own Chrome process with its own profile directory
//! and debugging port. A connected instance drives a single page:
//! - Hijacking uses the Fetch domain at the response stage. The enabled
//!   patterns always mirror the instance's `RouteTable`, so only responses
//!   some route wants are paused. A paused response is delivered to its
//!   routes and then continued, which means a full output channel holds the
//!   page's traffic back.
//! - Network idle is tracked from Network domain events.

use crate::browser::{
    Browser, BrowserError, BrowserLauncher, ControlHandle, ExchangeSink, InstanceConfig,
    RouteId, RouteTable, UrlPattern,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chromiumoxide::browser::{Browser as Chrome, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, DisableParams as FetchDisableParams, EnableParams as FetchEnableParams,
    EventRequestPaused, GetResponseBodyParams, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// How often an idle wait re-checks in-flight requests
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Launches Chrome instances
pub struct CdpLauncher {
    executable: Option<PathBuf>,
    request_timeout: Duration,
    launched: Mutex<HashMap<usize, LaunchedChrome>>,
}

struct LaunchedChrome {
    chrome: Chrome,
    handler: JoinHandle<()>,
}

impl CdpLauncher {
    pub fn new(executable: Option<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            executable,
            request_timeout,
            launched: Mutex::new(HashMap::new()),
        }
    }

    fn chrome_config(&self, config: &InstanceConfig) -> Result<ChromeConfig, String> {
        let mut builder = ChromeConfig::builder()
            .user_data_dir(&config.user_data_dir)
            .port(config.remote_debugging_port)
            .request_timeout(self.request_timeout);

        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.arg(format!("--user-agent={}", user_agent));
        }

        builder.build()
    }
}

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self, config: &InstanceConfig) -> Result<ControlHandle, BrowserError> {
        tokio::fs::create_dir_all(&config.user_data_dir).await?;

        let chrome_config = self
            .chrome_config(config)
            .map_err(|message| BrowserError::Launch {
                instance: config.id,
                message,
            })?;
        let (chrome, mut events) =
            Chrome::launch(chrome_config)
                .await
                .map_err(|e| BrowserError::Launch {
                    instance: config.id,
                    message: e.to_string(),
                })?;

        let instance = config.id;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    tracing::trace!(instance, "DevTools handler: {}", e);
                }
            }
            tracing::debug!(instance, "DevTools connection closed");
        });

        let endpoint = chrome.websocket_address().clone();
        tracing::debug!(instance, "Chrome listening at {}", endpoint);

        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.id, LaunchedChrome { chrome, handler });

        Ok(ControlHandle {
            instance_id: config.id,
            endpoint,
        })
    }

    async fn connect(&self, handle: &ControlHandle) -> Result<Box<dyn Browser>, BrowserError> {
        let launched = self
            .launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.instance_id)
            .ok_or_else(|| BrowserError::Connect {
                endpoint: handle.endpoint.clone(),
                message: "instance was not launched or is already connected".to_string(),
            })?;

        let connect_error = |e: chromiumoxide::error::CdpError| BrowserError::Connect {
            endpoint: handle.endpoint.clone(),
            message: e.to_string(),
        };

        let page = launched
            .chrome
            .new_page("about:blank")
            .await
            .map_err(connect_error)?;
        page.execute(NetworkEnableParams::default())
            .await
            .map_err(connect_error)?;

        let routes = Arc::new(RouteTable::new());
        let inflight = Arc::new(Inflight::default());

        let paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(connect_error)?;
        let started = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(connect_error)?;
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(connect_error)?;
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(connect_error)?;

        let tasks = vec![
            launched.handler,
            tokio::spawn(hijack(page.clone(), Arc::clone(&routes), paused)),
            tokio::spawn(track_requests(Arc::clone(&inflight), started, finished, failed)),
        ];

        Ok(Box::new(CdpBrowser {
            page,
            chrome: tokio::sync::Mutex::new(Some(launched.chrome)),
            routes,
            inflight,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connected Chrome instance driving one page
pub struct CdpBrowser {
    page: Page,
    chrome: tokio::sync::Mutex<Option<Chrome>>,
    routes: Arc<RouteTable>,
    inflight: Arc<Inflight>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CdpBrowser {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }

    /// Makes the Fetch domain pause exactly the installed patterns
    async fn sync_interception(&self) -> Result<(), BrowserError> {
        let patterns: Vec<RequestPattern> = self
            .routes
            .patterns()
            .iter()
            .map(|pattern| {
                RequestPattern::builder()
                    .url_pattern(pattern.as_str())
                    .request_stage(RequestStage::Response)
                    .build()
            })
            .collect();

        let synced = if patterns.is_empty() {
            self.page.execute(FetchDisableParams::default()).await.map(|_| ())
        } else {
            let params = FetchEnableParams::builder().patterns(patterns).build();
            self.page.execute(params).await.map(|_| ())
        };
        synced.map_err(|e| BrowserError::Route(e.to_string()))
    }
}

#[async_trait]
impl Browser for CdpBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        tracing::debug!("Loaded {}", url);
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Script(format!("click on {} failed: {}", selector, e)))?;
        Ok(())
    }

    async fn click_xpath(&self, selector: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let element = self
            .page
            .find_xpath(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Script(format!("click on {} failed: {}", selector, e)))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str, args: &[Value]) -> Result<Value, BrowserError> {
        self.ensure_open()?;
        let params = EvaluateParams::builder()
            .expression(call_expression(script, args))
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Script)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.ensure_open()?;
        let url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::Script(e.to_string()))?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn install_route(
        &self,
        pattern: &UrlPattern,
        sink: ExchangeSink,
    ) -> Result<RouteId, BrowserError> {
        self.ensure_open()?;
        let id = self.routes.install(pattern.clone(), sink);
        if let Err(e) = self.sync_interception().await {
            self.routes.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    async fn remove_route(&self, id: RouteId) -> Result<(), BrowserError> {
        if !self.routes.remove(id) {
            return Err(BrowserError::Route(format!("route {:?} is not installed", id)));
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.sync_interception().await
    }

    async fn wait_network_idle(
        &self,
        quiet: Duration,
        include: &[String],
        exclude: &[String],
    ) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let include: Vec<UrlPattern> = include.iter().map(UrlPattern::new).collect();
        let exclude: Vec<UrlPattern> = exclude.iter().map(UrlPattern::new).collect();

        let mut quiet_since: Option<Instant> = None;
        loop {
            if self.inflight.busy(&include, &exclude) {
                quiet_since = None;
            } else {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= quiet {
                    return Ok(());
                }
            }
            tokio::time::sleep(IDLE_POLL).await;
            self.ensure_open()?;
        }
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.routes.clear();

        let closed = match self.chrome.lock().await.take() {
            Some(mut chrome) => {
                let closed = chrome.close().await.map(|_| ());
                if let Err(e) = chrome.wait().await {
                    tracing::debug!("Waiting for Chrome to exit failed: {}", e);
                }
                closed.map_err(|e| BrowserError::Script(format!("close failed: {}", e)))
            }
            None => Ok(()),
        };

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        closed
    }
}

/// Wraps a function declaration into a call with JSON arguments
fn call_expression(script: &str, args: &[Value]) -> String {
    format!("({})(...{})", script.trim(), Value::Array(args.to_vec()))
}

/// Delivers paused responses to the routes that want them, then resumes them
async fn hijack(
    page: Page,
    routes: Arc<RouteTable>,
    mut paused: chromiumoxide::listeners::EventStream<EventRequestPaused>,
) {
    while let Some(event) = paused.next().await {
        let url = event.request.url.clone();

        let failed = event.response_error_reason.is_some()
            || event.response_status_code.map_or(false, |code| code >= 400);
        if !failed && !routes.matching(&url).is_empty() {
            match response_body(&page, &event).await {
                Ok(body) => {
                    let delivered = routes.deliver(&url, &body).await;
                    tracing::trace!("Hijacked {} ({} bytes, {} routes)", url, body.len(), delivered);
                }
                Err(e) => tracing::warn!("Could not read response body of {}: {}", url, e),
            }
        }

        if let Err(e) = page
            .execute(ContinueRequestParams::new(event.request_id.clone()))
            .await
        {
            tracing::debug!("Could not resume {}: {}", url, e);
        }
    }
}

async fn response_body(page: &Page, event: &EventRequestPaused) -> Result<Vec<u8>, BrowserError> {
    let response = page
        .execute(GetResponseBodyParams::new(event.request_id.clone()))
        .await
        .map_err(|e| BrowserError::Route(e.to_string()))?;

    if response.result.base64_encoded {
        general_purpose::STANDARD
            .decode(&response.result.body)
            .map_err(|e| BrowserError::Route(format!("invalid base64 body: {}", e)))
    } else {
        Ok(response.result.body.clone().into_bytes())
    }
}

/// Keeps `inflight` in step with the page's Network events
async fn track_requests(
    inflight: Arc<Inflight>,
    mut started: chromiumoxide::listeners::EventStream<EventRequestWillBeSent>,
    mut finished: chromiumoxide::listeners::EventStream<EventLoadingFinished>,
    mut failed: chromiumoxide::listeners::EventStream<EventLoadingFailed>,
) {
    loop {
        tokio::select! {
            Some(event) = started.next() => {
                inflight.start(event.request_id.inner(), &event.request.url);
            }
            Some(event) = finished.next() => inflight.finish(event.request_id.inner()),
            Some(event) = failed.next() => inflight.finish(event.request_id.inner()),
            else => break,
        }
    }
}

/// Requests the page has sent and not yet finished, by request id
#[derive(Debug, Default)]
struct Inflight {
    requests: Mutex<HashMap<String, String>>,
}

impl Inflight {
    fn start(&self, id: &str, url: &str) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), url.to_string());
    }

    fn finish(&self, id: &str) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Whether any in-flight request matches `include` (everything when
    /// empty) and none of `exclude`
    fn busy(&self, include: &[UrlPattern], exclude: &[UrlPattern]) -> bool {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|url| {
                (include.is_empty() || include.iter().any(|pattern| pattern.matches(url)))
                    && !exclude.iter().any(|pattern| pattern.matches(url))
            })
    }
}
