//! Streaming conversion, embedding and indexing of captured payloads
//!
//! One consumer runs per output channel. Each consumer:
//! - Groups payloads into batches by size and wait time
//! - Converts them to documents with the route's converter
//! - Embeds the documents under a concurrency limit shared by all consumers
//! - Hands the embedded documents to its own long-lived bulk writer
//!
//! Routes without a converter are observe-only: payloads are logged and
//! counted, and nothing is written. A failing batch is logged and skipped;
//! the consumer keeps going.

mod batcher;
mod bulk;
mod embed;

pub use batcher::{BatchConfig, Batcher};
pub use bulk::{BulkHooks, BulkIndexer, BulkSettings, BulkStats, BulkWriter, LoggingHooks};
pub use embed::BatchEmbedder;

use crate::config::{EmbeddingConfig, IndexingConfig, PipelineConfig};
use crate::document::{Document, DocumentConverter};
use crate::embedding::{Embedder, EmbeddingError};
use crate::job::{CapturedPayload, OutputRoute};
use crate::store::{SearchStore, StoreError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that fail a whole batch
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("No embedding slot became free within {0:?}")]
    PermitTimeout(Duration),

    #[error("Embedding slots were closed")]
    PermitsClosed,

    #[error("Bulk operation did not finish within {0:?}")]
    BulkTimeout(Duration),

    #[error("Bulk writer stopped")]
    WriterClosed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid similarity: {0}")]
    Similarity(String),

    #[error("Index registry lock poisoned")]
    Poisoned,
}

/// What one consumer did before its channel closed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub route: String,
    pub payloads: usize,

    /// Payloads only logged (observe-only route)
    pub observed: usize,

    pub conversion_failures: usize,
    pub documents_indexed: usize,
    pub documents_failed: usize,
    pub batch_failures: usize,

    /// Bulk flushes that failed as a whole
    pub flush_failures: usize,
}

impl ConsumerReport {
    fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ConsumerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} payloads, {} indexed, {} failed",
            self.route, self.payloads, self.documents_indexed, self.documents_failed
        )?;
        if self.observed > 0 {
            write!(f, ", {} observed", self.observed)?;
        }
        if self.conversion_failures > 0 {
            write!(f, ", {} unconvertible", self.conversion_failures)?;
        }
        if self.batch_failures > 0 {
            write!(f, ", {} batches dropped", self.batch_failures)?;
        }
        if self.flush_failures > 0 {
            write!(f, ", {} flushes failed", self.flush_failures)?;
        }
        Ok(())
    }
}

/// Shared embed-and-index machinery for all output consumers
#[derive(Clone)]
pub struct Pipeline {
    embedder: Arc<BatchEmbedder>,
    indexer: BulkIndexer,
    batch: BatchConfig,
}

impl Pipeline {
    pub fn new(embedder: BatchEmbedder, indexer: BulkIndexer, batch: BatchConfig) -> Self {
        Self {
            embedder: Arc::new(embedder),
            indexer,
            batch,
        }
    }

    /// Builds a pipeline from its configuration sections
    ///
    /// # Arguments
    ///
    /// * `embedder` - Backend that computes vectors
    /// * `store` - Destination for indexed documents
    ///
    /// # Returns
    ///
    /// * `Ok(Pipeline)` - Ready to spawn consumers
    /// * `Err(PipelineError)` - The configured similarity is unknown
    pub fn from_config(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn SearchStore>,
        embedding: &EmbeddingConfig,
        indexing: &IndexingConfig,
        pipeline: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let settings = BulkSettings::from_config(indexing).map_err(PipelineError::Similarity)?;

        Ok(Self::new(
            BatchEmbedder::new(
                embedder,
                embedding.batch_size,
                embedding.max_concurrency,
                embedding.permit_timeout(),
            ),
            BulkIndexer::new(store, settings),
            BatchConfig {
                max_size: pipeline.batch_size,
                max_wait: pipeline.batch_wait(),
            },
        ))
    }

    pub fn store(&self) -> &Arc<dyn SearchStore> {
        self.indexer.store()
    }

    /// Runs `consume` on its own task
    pub fn spawn_consumer(
        &self,
        route: OutputRoute,
        rx: mpsc::Receiver<CapturedPayload>,
        cancel: CancellationToken,
    ) -> JoinHandle<ConsumerReport> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.consume(route, rx, cancel).await })
    }

    /// Processes payloads from one output channel until it is closed and
    /// drained, or until `cancel` fires
    ///
    /// Documents already handed to the bulk writer are flushed before the
    /// report is returned, cancelled or not.
    pub async fn consume(
        &self,
        route: OutputRoute,
        rx: mpsc::Receiver<CapturedPayload>,
        cancel: CancellationToken,
    ) -> ConsumerReport {
        let mut report = ConsumerReport::new(route.name.clone());
        let mut batcher = Batcher::new(rx, self.batch.clone());
        let writer = route.converter.as_ref().map(|_| self.indexer.writer());

        debug!(
            route = %route.name,
            observe_only = route.is_observe_only(),
            "Consumer started"
        );

        loop {
            let batch = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(route = %route.name, "Consumer cancelled");
                    break;
                }

                batch = batcher.next_batch() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            report.payloads += batch.len();
            match (&route.converter, &writer) {
                (Some(converter), Some(writer)) => {
                    self.process_batch(&route.name, converter.as_ref(), writer, batch, &mut report)
                        .await
                }
                _ => observe(&route.name, &batch, &mut report),
            }
        }

        if let Some(writer) = writer {
            let stats = writer.finish().await;
            report.documents_indexed += stats.indexed;
            report.documents_failed += stats.failed;
            report.flush_failures += stats.failed_flushes;
            debug!(
                route = %route.name,
                "Bulk writer done: {} indexed, {} failed in {} flushes",
                stats.indexed,
                stats.failed,
                stats.flushes
            );
        }

        info!("Consumer finished: {}", report);
        report
    }

    async fn process_batch(
        &self,
        route: &str,
        converter: &dyn DocumentConverter,
        writer: &BulkWriter,
        batch: Vec<CapturedPayload>,
        report: &mut ConsumerReport,
    ) {
        let mut documents: Vec<Document> = Vec::new();
        for payload in &batch {
            match converter.to_documents(payload) {
                Ok(converted) => documents.extend(converted),
                Err(e) => {
                    report.conversion_failures += 1;
                    warn!(route, source = %payload.source_url, "Skipping payload: {}", e);
                }
            }
        }

        if documents.is_empty() {
            return;
        }

        let count = documents.len();
        if let Err(e) = self.embedder.embed_documents(&mut documents).await {
            report.batch_failures += 1;
            report.documents_failed += count;
            error!(route, "Dropping batch of {} documents: {}", count, e);
            return;
        }

        if let Err(e) = writer.submit(documents).await {
            report.batch_failures += 1;
            report.documents_failed += count;
            error!(route, "Dropping batch of {} documents: {}", count, e);
            return;
        }
        debug!(route, "Queued {} embedded documents for indexing", count);
    }
}

fn observe(route: &str, batch: &[CapturedPayload], report: &mut ConsumerReport) {
    for payload in batch {
        info!(
            route,
            source = %payload.source_url,
            pattern = %payload.matched_pattern,
            bytes = payload.len(),
            "Observed payload"
        );
    }
    report.observed += batch.len();
}
