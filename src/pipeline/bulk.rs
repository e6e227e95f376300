//! Bulk indexing of embedded documents
//!
//! A `BulkWriter` owns a flush worker that lives as long as the writer. Each
//! output consumer keeps one writer for its whole run, submitting documents
//! batch after batch. The worker buffers them and flushes to the store when
//! the buffer reaches `flush_bytes` or when `flush_interval` elapses,
//! whichever comes first. Each flush runs under `operation_timeout`; a failed
//! flush counts its own documents as failed and the worker carries on.

use crate::config::IndexingConfig;
use crate::document::Document;
use crate::pipeline::PipelineError;
use crate::store::{BulkItemResult, BulkResponse, IndexSchema, SearchStore, Similarity};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Documents buffered between a writer and its flush worker
const WRITER_BUFFER: usize = 256;

/// Flush and timeout settings for a bulk indexer
#[derive(Debug, Clone)]
pub struct BulkSettings {
    pub flush_bytes: usize,
    pub flush_interval: Duration,
    pub operation_timeout: Duration,
    pub similarity: Similarity,
}

impl BulkSettings {
    pub fn from_config(config: &IndexingConfig) -> Result<Self, String> {
        Ok(Self {
            flush_bytes: config.flush_bytes,
            flush_interval: config.flush_interval(),
            operation_timeout: config.operation_timeout(),
            similarity: config.similarity.parse()?,
        })
    }
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            flush_bytes: 5 * 1024 * 1024,
            flush_interval: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(30),
            similarity: Similarity::Cosine,
        }
    }
}

/// Callbacks invoked once per document after each flush
pub trait BulkHooks: Send + Sync {
    fn on_success(&self, item: &BulkItemResult) {
        debug!(index = %item.index, id = %item.id, "Indexed document");
    }

    fn on_failure(&self, item: &BulkItemResult, error: &str) {
        warn!(index = %item.index, id = %item.id, "Failed to index document: {}", error);
    }
}

/// Hooks that only log
#[derive(Debug, Default)]
pub struct LoggingHooks;

impl BulkHooks for LoggingHooks {}

/// Totals for one writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    pub indexed: usize,
    pub failed: usize,
    pub flushes: usize,

    /// Flushes that failed as a whole (store error or timeout)
    pub failed_flushes: usize,
}

impl BulkStats {
    fn record_failure(&mut self, documents: usize) {
        self.failed += documents;
        self.failed_flushes += 1;
    }
}

/// Shared store, settings and hooks; hands out writers
#[derive(Clone)]
pub struct BulkIndexer {
    store: Arc<dyn SearchStore>,
    settings: BulkSettings,
    hooks: Arc<dyn BulkHooks>,
    known_indexes: Arc<Mutex<HashSet<String>>>,
}

impl BulkIndexer {
    pub fn new(store: Arc<dyn SearchStore>, settings: BulkSettings) -> Self {
        Self {
            store,
            settings,
            hooks: Arc::new(LoggingHooks),
            known_indexes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn BulkHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &Arc<dyn SearchStore> {
        &self.store
    }

    /// Starts a flush worker and returns the writer feeding it
    pub fn writer(&self) -> BulkWriter {
        let (documents, rx) = mpsc::channel(WRITER_BUFFER);
        let worker = tokio::spawn(self.clone().flush_loop(rx));
        BulkWriter { documents, worker }
    }

    async fn flush_loop(self, mut rx: mpsc::Receiver<Document>) -> BulkStats {
        let mut stats = BulkStats::default();
        let mut buffer = Vec::new();
        let mut buffered_bytes = 0usize;

        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(document) => {
                        buffered_bytes += document.encoded_len();
                        buffer.push(document);
                        if buffered_bytes >= self.settings.flush_bytes {
                            self.flush(&mut buffer, &mut stats).await;
                            buffered_bytes = 0;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        debug!("Flush interval elapsed with {} documents buffered", buffer.len());
                        self.flush(&mut buffer, &mut stats).await;
                        buffered_bytes = 0;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer, &mut stats).await;
        }
        stats
    }

    async fn flush(&self, buffer: &mut Vec<Document>, stats: &mut BulkStats) {
        let batch = std::mem::take(buffer);
        stats.flushes += 1;

        let limit = self.settings.operation_timeout;
        let written = tokio::time::timeout(limit, self.write(&batch))
            .await
            .unwrap_or_else(|_| Err(PipelineError::BulkTimeout(limit)));

        let response = match written {
            Ok(response) => response,
            Err(e) => {
                error!("Bulk flush of {} documents failed: {}", batch.len(), e);
                stats.record_failure(batch.len());
                let message = e.to_string();
                for document in &batch {
                    let item = BulkItemResult {
                        id: document.id.clone(),
                        index: document.index.clone(),
                        error: Some(message.clone()),
                    };
                    self.hooks.on_failure(&item, &message);
                }
                return;
            }
        };

        for item in &response.items {
            match &item.error {
                None => {
                    stats.indexed += 1;
                    self.hooks.on_success(item);
                }
                Some(error) => {
                    stats.failed += 1;
                    self.hooks.on_failure(item, error);
                }
            }
        }

        debug!(
            "Flushed {} documents ({} failed)",
            response.items.len(),
            response.failed()
        );
    }

    async fn write(&self, batch: &[Document]) -> Result<BulkResponse, PipelineError> {
        self.ensure_indexes(batch).await?;
        Ok(self.store.bulk_upsert(batch).await?)
    }

    /// Creates each target index the first time this indexer sees it
    ///
    /// The dimension comes from the first embedded document for that index.
    async fn ensure_indexes(&self, documents: &[Document]) -> Result<(), PipelineError> {
        let mut pending: Vec<IndexSchema> = Vec::new();
        {
            let known = self
                .known_indexes
                .lock()
                .map_err(|_| PipelineError::Poisoned)?;
            for document in documents {
                if known.contains(&document.index)
                    || pending.iter().any(|schema| schema.name == document.index)
                {
                    continue;
                }
                if let Some(embedding) = &document.embedding {
                    pending.push(IndexSchema {
                        name: document.index.clone(),
                        dims: embedding.len(),
                        similarity: self.settings.similarity,
                    });
                }
            }
        }

        for schema in pending {
            if self.store.create_index(&schema).await? {
                debug!(
                    "Created index {} ({} dims, {})",
                    schema.name, schema.dims, schema.similarity
                );
            }
            self.known_indexes
                .lock()
                .map_err(|_| PipelineError::Poisoned)?
                .insert(schema.name);
        }
        Ok(())
    }
}

/// Sending half of a running flush worker
pub struct BulkWriter {
    documents: mpsc::Sender<Document>,
    worker: JoinHandle<BulkStats>,
}

impl BulkWriter {
    /// Queues `documents` for the flush worker, waiting while its buffer is
    /// full
    pub async fn submit(&self, documents: Vec<Document>) -> Result<(), PipelineError> {
        for document in documents {
            self.documents
                .send(document)
                .await
                .map_err(|_| PipelineError::WriterClosed)?;
        }
        Ok(())
    }

    /// Flushes whatever is still buffered and returns the writer's totals
    pub async fn finish(self) -> BulkStats {
        drop(self.documents);
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Bulk flush worker failed: {}", e);
                BulkStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::testing::MemoryStore;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn embedded(id: &str, index: &str, dims: usize) -> Document {
        let mut fields = Map::new();
        fields.insert("title".to_string(), json!(id));
        let mut document = Document::new(id, index, fields, id);
        document.set_embedding(vec![1.0; dims]);
        document
    }

    async fn index_all(indexer: &BulkIndexer, documents: Vec<Document>) -> BulkStats {
        let writer = indexer.writer();
        writer.submit(documents).await.unwrap();
        writer.finish().await
    }

    #[derive(Default)]
    struct CountingHooks {
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl BulkHooks for CountingHooks {
        fn on_success(&self, _item: &BulkItemResult) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _item: &BulkItemResult, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_index_creates_index_and_writes() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let indexer = BulkIndexer::new(store.clone(), BulkSettings::default());

        let stats = index_all(&indexer, vec![embedded("a", "docs", 3), embedded("b", "docs", 3)]).await;

        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.flushes, 1);
        assert_eq!(store.count("docs").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_small_flush_bytes_flushes_per_document() {
        let store = Arc::new(MemoryStore::default());
        let settings = BulkSettings {
            flush_bytes: 1,
            ..BulkSettings::default()
        };
        let indexer = BulkIndexer::new(store.clone(), settings);

        let stats = index_all(
            &indexer,
            vec![embedded("a", "docs", 2), embedded("b", "docs", 2), embedded("c", "docs", 2)],
        )
        .await;

        assert_eq!(stats.flushes, 3);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_interval_flushes_before_writer_finishes() {
        let store = Arc::new(MemoryStore::default());
        let settings = BulkSettings {
            flush_interval: Duration::from_millis(50),
            ..BulkSettings::default()
        };
        let indexer = BulkIndexer::new(store.clone(), settings);
        let writer = indexer.writer();

        writer.submit(vec![embedded("a", "docs", 2)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Far below flush_bytes, so only the interval can have written it
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.document_count("docs"), 1);

        writer.submit(vec![embedded("b", "docs", 2)]).await.unwrap();
        let stats = writer.finish().await;

        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.indexed, 2);
    }

    #[tokio::test]
    async fn test_writer_buffers_across_submissions() {
        let store = Arc::new(MemoryStore::default());
        let indexer = BulkIndexer::new(store.clone(), BulkSettings::default());
        let writer = indexer.writer();

        for id in ["a", "b", "c"] {
            writer.submit(vec![embedded(id, "docs", 2)]).await.unwrap();
        }
        let stats = writer.finish().await;

        assert_eq!(stats.flushes, 1);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.document_count("docs"), 3);
    }

    #[tokio::test]
    async fn test_item_failures_reach_hooks() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let hooks = Arc::new(CountingHooks::default());
        let indexer = BulkIndexer::new(store, BulkSettings::default()).with_hooks(hooks.clone());

        let unembedded = Document::new("c", "docs", Map::new(), "c");
        let stats = index_all(
            &indexer,
            vec![embedded("a", "docs", 3), unembedded, embedded("b", "docs", 4)],
        )
        .await;

        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(hooks.successes.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_operation_timeout_fails_only_that_flush() {
        let store = Arc::new(MemoryStore::default().with_delay(Duration::from_millis(200)));
        let hooks = Arc::new(CountingHooks::default());
        let settings = BulkSettings {
            operation_timeout: Duration::from_millis(20),
            ..BulkSettings::default()
        };
        let indexer = BulkIndexer::new(store, settings).with_hooks(hooks.clone());

        let stats = index_all(&indexer, vec![embedded("a", "docs", 2), embedded("b", "docs", 2)]).await;

        assert_eq!(stats.indexed, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(hooks.failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_earlier_totals() {
        let store = Arc::new(MemoryStore::default().failing_write_at(1));
        let settings = BulkSettings {
            flush_bytes: 1,
            ..BulkSettings::default()
        };
        let indexer = BulkIndexer::new(store.clone(), settings);

        let stats = index_all(
            &indexer,
            vec![embedded("a", "docs", 2), embedded("b", "docs", 2), embedded("c", "docs", 2)],
        )
        .await;

        assert_eq!(stats.flushes, 3);
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(store.document_count("docs"), 2);
    }

    #[tokio::test]
    async fn test_unused_writer_touches_nothing() {
        let store = Arc::new(MemoryStore::default());
        let indexer = BulkIndexer::new(store.clone(), BulkSettings::default());

        assert_eq!(indexer.writer().finish().await, BulkStats::default());
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.index_count(), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let config = IndexingConfig {
            database_path: "siphon.db".into(),
            flush_bytes: 1024,
            flush_interval_ms: 500,
            operation_timeout_ms: 1000,
            similarity: "l2".to_string(),
        };
        let settings = BulkSettings::from_config(&config).unwrap();
        assert_eq!(settings.flush_bytes, 1024);
        assert_eq!(settings.flush_interval, Duration::from_millis(500));
        assert_eq!(settings.similarity, Similarity::L2);

        let bad = IndexingConfig {
            similarity: "hamming".to_string(),
            ..config
        };
        assert!(BulkSettings::from_config(&bad).is_err());
    }
}
