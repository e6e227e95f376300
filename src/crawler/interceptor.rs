//! Per-job network interception
//!
//! A job's rules are installed on its leased browser with one shared delivery
//! channel. A router task maps each delivered exchange back to the rule that
//! matched it and forwards it as a `CapturedPayload` on that rule's output
//! channel.
//!
//! Lifecycle:
//! - `Router::install` registers every pattern (all or nothing)
//! - `Router::run` starts the router task
//! - `Router::stop` unregisters the patterns, forwards everything already
//!   captured, and joins the task
//!
//! A full output channel stalls forwarding. Captured exchanges are only
//! dropped once the job is cancelled.

use crate::browser::{Browser, BrowserError, Exchange, RouteId, UrlPattern};
use crate::job::CapturedPayload;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exchanges buffered between the browser and the router task
const EXCHANGE_BUFFER: usize = 16;

/// An interception rule bound to the sending half of its output channel
#[derive(Debug, Clone)]
pub struct BoundRule {
    pub pattern: UrlPattern,

    /// Output channel name, for logs
    pub route: String,

    pub sender: mpsc::Sender<CapturedPayload>,
}

/// What a router did over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: usize,
    pub dropped: usize,
}

#[derive(Clone)]
struct Target {
    pattern: String,
    route: String,
    sender: mpsc::Sender<CapturedPayload>,
}

/// Routes a job's hijacked exchanges to its output channels
pub struct Router {
    installed: Vec<RouteId>,
    targets: HashMap<RouteId, Target>,
    exchanges: Option<mpsc::Receiver<Exchange>>,
    stop: CancellationToken,
    task: Option<JoinHandle<RouterStats>>,
}

impl Router {
    /// Registers every rule on `browser`
    ///
    /// If one registration fails, the routes installed so far are removed
    /// again and the error is returned.
    ///
    /// # Arguments
    ///
    /// * `browser` - The leased browser the job runs on
    /// * `rules` - The job's interception rules
    /// * `cancel` - The job's cancellation token; the router stops with it
    pub async fn install(
        browser: &dyn Browser,
        rules: &[BoundRule],
        cancel: &CancellationToken,
    ) -> Result<Self, BrowserError> {
        let (sink, exchanges) = mpsc::channel(EXCHANGE_BUFFER);
        let mut installed = Vec::with_capacity(rules.len());
        let mut targets = HashMap::with_capacity(rules.len());

        for rule in rules {
            match browser.install_route(&rule.pattern, sink.clone()).await {
                Ok(id) => {
                    installed.push(id);
                    targets.insert(
                        id,
                        Target {
                            pattern: rule.pattern.to_string(),
                            route: rule.route.clone(),
                            sender: rule.sender.clone(),
                        },
                    );
                }
                Err(e) => {
                    remove_routes(browser, &installed).await;
                    return Err(e);
                }
            }
        }

        tracing::debug!("Installed {} interception routes", installed.len());
        Ok(Self {
            installed,
            targets,
            exchanges: Some(exchanges),
            stop: cancel.child_token(),
            task: None,
        })
    }

    /// Number of installed routes
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    /// Spawns the router task; later calls do nothing
    pub fn run(&mut self) {
        let Some(exchanges) = self.exchanges.take() else {
            return;
        };
        let targets = std::mem::take(&mut self.targets);
        let stop = self.stop.clone();
        self.task = Some(tokio::spawn(route_exchanges(exchanges, targets, stop)));
    }

    /// Removes the routes from `browser` and waits for the router task
    ///
    /// Exchanges captured before removal are all forwarded, however long the
    /// output channels take to make room. Only the job's cancellation ends the
    /// wait early. A warning is logged every `stall_warning` while forwarding
    /// is blocked.
    pub async fn stop(mut self, browser: &dyn Browser, stall_warning: Duration) -> RouterStats {
        remove_routes(browser, &self.installed).await;
        // Nothing can reach the task once every route's sink is gone
        self.exchanges = None;

        let Some(mut task) = self.task.take() else {
            return RouterStats::default();
        };

        let stall_warning = stall_warning.max(Duration::from_millis(1));
        let mut waited = Duration::ZERO;
        let joined = loop {
            match tokio::time::timeout(stall_warning, &mut task).await {
                Ok(joined) => break joined,
                Err(_) => {
                    waited += stall_warning;
                    tracing::warn!(
                        "Outputs are full, still forwarding captured traffic after {:?}",
                        waited
                    );
                }
            }
        };

        match joined {
            Ok(stats) => {
                if stats.dropped > 0 {
                    tracing::warn!(
                        "Router stopped: {} forwarded, {} dropped",
                        stats.forwarded,
                        stats.dropped
                    );
                } else {
                    tracing::debug!("Router stopped: {} forwarded", stats.forwarded);
                }
                stats
            }
            Err(e) => {
                tracing::error!("Router task failed: {}", e);
                RouterStats::default()
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn remove_routes(browser: &dyn Browser, routes: &[RouteId]) {
    for id in routes {
        if let Err(e) = browser.remove_route(*id).await {
            tracing::warn!("Failed to remove route {:?}: {}", id, e);
        }
    }
}

async fn route_exchanges(
    mut exchanges: mpsc::Receiver<Exchange>,
    targets: HashMap<RouteId, Target>,
    stop: CancellationToken,
) -> RouterStats {
    let mut stats = RouterStats::default();

    loop {
        let exchange = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = exchanges.recv() => match next {
                Some(exchange) => exchange,
                None => break,
            },
        };

        let Some(target) = targets.get(&exchange.route) else {
            tracing::warn!("Exchange for unknown route {:?} dropped", exchange.route);
            stats.dropped += 1;
            continue;
        };

        let payload = CapturedPayload::new(exchange.url, target.pattern.clone(), exchange.body);
        tracing::trace!(
            "Captured {} bytes from {} for {}",
            payload.len(),
            payload.source_url,
            target.route
        );

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                stats.dropped += 1;
                break;
            }
            sent = target.sender.send(payload) => match sent {
                Ok(()) => stats.forwarded += 1,
                Err(_) => {
                    tracing::warn!("Output {} is closed, payload dropped", target.route);
                    stats.dropped += 1;
                }
            },
        }
    }

    // Whatever is still buffered was never forwarded
    exchanges.close();
    while exchanges.try_recv().is_ok() {
        stats.dropped += 1;
    }

    stats
}
