use crate::browser::{Exchange, ExchangeSink, RouteId, UrlPattern};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Installed hijack routes for one browser instance
///
/// Backends keep one table per instance and consult it for every response.
/// Removing a route drops its sink, which lets the owning router see its
/// delivery channel close.
#[derive(Debug, Default)]
pub struct RouteTable {
    next_id: AtomicU64,
    routes: Mutex<Vec<(RouteId, UrlPattern, ExchangeSink)>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pattern and returns its id
    pub fn install(&self, pattern: UrlPattern, sink: ExchangeSink) -> RouteId {
        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, pattern, sink));
        id
    }

    /// Removes a route; returns false if it was not installed
    pub fn remove(&self, id: RouteId) -> bool {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|(route_id, _, _)| *route_id != id);
        routes.len() != before
    }

    /// Drops every route
    pub fn clear(&self) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Patterns of every installed route, in install order
    pub fn patterns(&self) -> Vec<UrlPattern> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, pattern, _)| pattern.clone())
            .collect()
    }

    /// Returns the sinks of every route whose pattern matches `url`
    pub fn matching(&self, url: &str) -> Vec<(RouteId, ExchangeSink)> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, pattern, _)| pattern.matches(url))
            .map(|(id, _, sink)| (*id, sink.clone()))
            .collect()
    }

    /// Delivers a loaded response to every matching route
    ///
    /// Waits for capacity on each sink, which is how a slow consumer throttles
    /// capture. Returns the number of routes the exchange was delivered to.
    pub async fn deliver(&self, url: &str, body: &[u8]) -> usize {
        let mut delivered = 0;
        for (route, sink) in self.matching(url) {
            let exchange = Exchange {
                route,
                url: url.to_string(),
                body: body.to_vec(),
            };
            if sink.send(exchange).await.is_ok() {
                delivered += 1;
            } else {
                tracing::debug!("Route {:?} closed before delivery of {}", route, url);
            }
        }
        delivered
    }
}
