use crate::document::Document;
use crate::embedding::{Embedder, EmbeddingError};
use crate::pipeline::PipelineError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Splits embedding work into bounded calls under a shared concurrency limit
///
/// Every call to the backend holds one permit. Consumers of one pipeline
/// share the same permits, so at most `max_concurrency` calls are in flight
/// across all output channels.
pub struct BatchEmbedder {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    permits: Arc<Semaphore>,
    permit_timeout: Duration,
}

impl BatchEmbedder {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        max_concurrency: usize,
        permit_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            permit_timeout,
        }
    }

    /// Embeds `texts` in order, `batch_size` at a time
    ///
    /// # Returns
    ///
    /// * `Ok(vectors)` - One vector per text, in input order
    /// * `Err(PipelineError)` - A call failed, returned the wrong number of
    ///   vectors, or no permit became free within the permit timeout
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            let _permit = tokio::time::timeout(self.permit_timeout, self.permits.acquire())
                .await
                .map_err(|_| PipelineError::PermitTimeout(self.permit_timeout))?
                .map_err(|_| PipelineError::PermitsClosed)?;

            let embedded = self.embedder.embed(chunk).await?;
            if embedded.len() != chunk.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: chunk.len(),
                    actual: embedded.len(),
                }
                .into());
            }
            vectors.extend(embedded);
        }

        Ok(vectors)
    }

    /// Computes and attaches an embedding to every document, by position
    pub async fn embed_documents(&self, documents: &mut [Document]) -> Result<(), PipelineError> {
        let texts: Vec<String> = documents
            .iter()
            .map(|document| document.embedding_text.clone())
            .collect();

        let vectors = self.embed(&texts).await?;
        for (document, vector) in documents.iter_mut().zip(vectors) {
            document.set_embedding(vector);
        }
        Ok(())
    }
}
