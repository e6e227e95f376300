//! In-memory stand-ins for browsers, launchers, embedders and stores

use crate::browser::{
    Browser, BrowserError, BrowserLauncher, ControlHandle, ExchangeSink, InstanceConfig, RouteId,
    RouteTable, UrlPattern,
};
use crate::document::Document;
use crate::embedding::{Embedder, EmbeddingError};
use crate::store::{
    BulkItemResult, BulkResponse, IndexInfo, IndexSchema, SearchHit, SearchStore, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks how many navigations are in flight at once
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    inner: Arc<GaugeCounters>,
}

#[derive(Debug, Default)]
struct GaugeCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    fn enter(&self) -> GaugeGuard {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        self.inner.total.fetch_add(1, Ordering::SeqCst);
        GaugeGuard {
            counters: Arc::clone(&self.inner),
        }
    }
}

struct GaugeGuard {
    counters: Arc<GaugeCounters>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A scripted browser
///
/// Records every call as a log line, replays configured traffic through its
/// route table on navigation, and fails where told to.
pub struct FakeBrowser {
    routes: RouteTable,
    traffic: HashMap<String, Vec<(String, Vec<u8>)>>,
    failing_selectors: HashSet<String>,
    failing_urls: HashSet<String>,
    script_result: Value,
    route_install_failure: Option<usize>,
    navigation_delay: Duration,
    never_idle: bool,
    gauge: Option<ConcurrencyGauge>,
    log: Mutex<Vec<String>>,
    current_url: Mutex<Option<String>>,
    installs: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl Default for FakeBrowser {
    fn default() -> Self {
        Self {
            routes: RouteTable::new(),
            traffic: HashMap::new(),
            failing_selectors: HashSet::new(),
            failing_urls: HashSet::new(),
            script_result: Value::Null,
            route_install_failure: None,
            navigation_delay: Duration::ZERO,
            never_idle: false,
            gauge: None,
            log: Mutex::new(Vec::new()),
            current_url: Mutex::new(None),
            installs: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FakeBrowser {
    /// Responses loaded when `page` is navigated to, in order
    pub fn with_traffic(mut self, page: &str, responses: Vec<(&str, Vec<u8>)>) -> Self {
        self.traffic.insert(
            page.to_string(),
            responses
                .into_iter()
                .map(|(url, body)| (url.to_string(), body))
                .collect(),
        );
        self
    }

    /// Makes the `n`th route installation (zero-based) fail
    pub fn failing_route_install_at(mut self, n: usize) -> Self {
        self.route_install_failure = Some(n);
        self
    }

    pub fn failing_selector(mut self, selector: &str) -> Self {
        self.failing_selectors.insert(selector.to_string());
        self
    }

    pub fn failing_url(mut self, url: &str) -> Self {
        self.failing_urls.insert(url.to_string());
        self
    }

    pub fn with_script_result(mut self, result: Value) -> Self {
        self.script_result = result;
        self
    }

    pub fn with_gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = delay;
        self
    }

    /// Network never goes idle
    pub fn never_idle(mut self) -> Self {
        self.never_idle = true;
        self
    }

    fn with_close_counter(mut self, closes: Arc<AtomicUsize>) -> Self {
        self.closes = closes;
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    fn record(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.record(format!("navigate {}", url));
        let _guard = self.gauge.as_ref().map(ConcurrencyGauge::enter);

        if !self.navigation_delay.is_zero() {
            tokio::time::sleep(self.navigation_delay).await;
        }
        if self.failing_urls.contains(url) {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }

        if let Ok(mut current) = self.current_url.lock() {
            *current = Some(url.to_string());
        }
        if let Some(responses) = self.traffic.get(url) {
            for (response_url, body) in responses {
                self.routes.deliver(response_url, body).await;
            }
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.record(format!("click {}", selector));
        if self.failing_selectors.contains(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn click_xpath(&self, selector: &str) -> Result<(), BrowserError> {
        self.record(format!("click-xpath {}", selector));
        if self.failing_selectors.contains(selector) {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn evaluate(&self, _script: &str, args: &[Value]) -> Result<Value, BrowserError> {
        self.record(format!("evaluate {}", Value::Array(args.to_vec())));
        Ok(self.script_result.clone())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.current_url
            .lock()
            .ok()
            .and_then(|current| current.clone())
            .ok_or_else(|| BrowserError::Script("no page loaded".to_string()))
    }

    async fn install_route(
        &self,
        pattern: &UrlPattern,
        sink: ExchangeSink,
    ) -> Result<RouteId, BrowserError> {
        let attempt = self.installs.fetch_add(1, Ordering::SeqCst);
        if self.route_install_failure == Some(attempt) {
            return Err(BrowserError::Route(format!("cannot hijack {}", pattern)));
        }
        Ok(self.routes.install(pattern.clone(), sink))
    }

    async fn remove_route(&self, id: RouteId) -> Result<(), BrowserError> {
        self.routes.remove(id);
        Ok(())
    }

    async fn wait_network_idle(
        &self,
        _quiet: Duration,
        _include: &[String],
        _exclude: &[String],
    ) -> Result<(), BrowserError> {
        if self.never_idle {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.routes.clear();
        Ok(())
    }
}

/// Launches `FakeBrowser`s, remembering the ports it was asked for
#[derive(Default)]
pub struct FakeLauncher {
    fail_at: Option<usize>,
    ports: Mutex<Vec<u16>>,
    closes: Arc<AtomicUsize>,
}

impl FakeLauncher {
    /// Fails the launch of instance `id`
    pub fn failing_at(id: usize) -> Self {
        Self {
            fail_at: Some(id),
            ..Self::default()
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().map(|ports| ports.clone()).unwrap_or_default()
    }

    /// Closes across every browser this launcher connected
    pub fn closed_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, config: &InstanceConfig) -> Result<ControlHandle, BrowserError> {
        if self.fail_at == Some(config.id) {
            return Err(BrowserError::Launch {
                instance: config.id,
                message: "exited during startup".to_string(),
            });
        }
        if let Ok(mut ports) = self.ports.lock() {
            ports.push(config.remote_debugging_port);
        }
        Ok(ControlHandle {
            instance_id: config.id,
            endpoint: format!("fake://{}", config.remote_debugging_port),
        })
    }

    async fn connect(&self, _handle: &ControlHandle) -> Result<Box<dyn Browser>, BrowserError> {
        Ok(Box::new(
            FakeBrowser::default().with_close_counter(Arc::clone(&self.closes)),
        ))
    }
}

/// Deterministic embedder
///
/// The first component of each vector is the text's position across all
/// calls so far; the rest are ones.
pub struct FakeEmbedder {
    dims: usize,
    calls: Mutex<Vec<usize>>,
    embedded: AtomicUsize,
    drop_last: bool,
    delay: Duration,
    poison: Option<String>,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            calls: Mutex::new(Vec::new()),
            embedded: AtomicUsize::new(0),
            drop_last: false,
            delay: Duration::ZERO,
            poison: None,
        }
    }

    /// Returns one vector too few per call
    pub fn dropping_last(mut self) -> Self {
        self.drop_last = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails any call containing a text that includes `marker`
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.poison = Some(marker.to_string());
        self
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(texts.len());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(marker) = &self.poison {
            if texts.iter().any(|text| text.contains(marker.as_str())) {
                return Err(EmbeddingError::Api {
                    status: 500,
                    body: format!("cannot embed {}", marker),
                });
            }
        }

        let start = self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        let mut vectors: Vec<Vec<f32>> = (0..texts.len())
            .map(|i| {
                let mut vector = vec![1.0; self.dims];
                vector[0] = (start + i) as f32;
                vector
            })
            .collect();
        if self.drop_last {
            vectors.pop();
        }
        Ok(vectors)
    }
}

/// Search store held in memory, counting bulk writes
#[derive(Default)]
pub struct MemoryStore {
    indexes: Mutex<HashMap<String, IndexSchema>>,
    documents: Mutex<HashMap<(String, String), Document>>,
    writes: AtomicUsize,
    delay: Duration,
    failing_write: Option<usize>,
}

impl MemoryStore {
    /// Delays every bulk write
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the `n`th bulk write (zero-based) fail as a whole
    pub fn failing_write_at(mut self, n: usize) -> Self {
        self.failing_write = Some(n);
        self
    }

    /// Number of bulk requests received
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn index_count(&self) -> usize {
        self.indexes.lock().map(|indexes| indexes.len()).unwrap_or(0)
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.documents
            .lock()
            .map(|documents| documents.keys().filter(|(name, _)| name == index).count())
            .unwrap_or(0)
    }

    fn poisoned() -> StoreError {
        StoreError::Task("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl SearchStore for MemoryStore {
    async fn create_index(&self, schema: &IndexSchema) -> StoreResult<bool> {
        let mut indexes = self.indexes.lock().map_err(|_| Self::poisoned())?;
        if indexes.contains_key(&schema.name) {
            return Ok(false);
        }
        indexes.insert(schema.name.clone(), schema.clone());
        Ok(true)
    }

    async fn bulk_upsert(&self, documents: &[Document]) -> StoreResult<BulkResponse> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing_write == Some(attempt) {
            return Err(StoreError::Task("bulk write rejected".to_string()));
        }

        let indexes = self.indexes.lock().map_err(|_| Self::poisoned())?.clone();
        let mut stored = self.documents.lock().map_err(|_| Self::poisoned())?;

        let items = documents
            .iter()
            .map(|document| {
                let error = match (&document.embedding, indexes.get(&document.index)) {
                    (None, _) => Some("document has no embedding".to_string()),
                    (Some(_), None) => Some(format!("index not found: {}", document.index)),
                    (Some(vector), Some(schema)) if vector.len() != schema.dims => Some(format!(
                        "expected {} dimensions, got {}",
                        schema.dims,
                        vector.len()
                    )),
                    _ => None,
                };
                if error.is_none() {
                    stored.insert(
                        (document.index.clone(), document.id.clone()),
                        document.clone(),
                    );
                }
                BulkItemResult {
                    id: document.id.clone(),
                    index: document.index.clone(),
                    error,
                }
            })
            .collect();

        Ok(BulkResponse { items })
    }

    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
        _num_candidates: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let schema = self
            .indexes
            .lock()
            .map_err(|_| Self::poisoned())?
            .get(index)
            .cloned()
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        let stored = self.documents.lock().map_err(|_| Self::poisoned())?;

        let mut hits: Vec<SearchHit> = stored
            .values()
            .filter(|document| document.index == index)
            .filter_map(|document| {
                let embedding = document.embedding.as_ref()?;
                Some(SearchHit {
                    id: document.id.clone(),
                    index: document.index.clone(),
                    score: schema.similarity.score(vector, embedding),
                    fields: document.fields.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self, index: &str) -> StoreResult<u64> {
        Ok(self.document_count(index) as u64)
    }

    async fn list_indexes(&self) -> StoreResult<Vec<IndexInfo>> {
        let indexes = self.indexes.lock().map_err(|_| Self::poisoned())?.clone();
        let mut infos: Vec<IndexInfo> = indexes
            .into_values()
            .map(|schema| IndexInfo {
                documents: self.document_count(&schema.name) as u64,
                name: schema.name,
                dims: schema.dims,
                similarity: schema.similarity,
                created_at: String::new(),
                last_indexed_at: None,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
