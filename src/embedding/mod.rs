//! Embedding backends
//!
//! The pipeline only sees the `Embedder` trait: an ordered list of texts in,
//! one vector per text out, in the same order.

mod ollama;

pub use ollama::OllamaEmbedder;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while computing embeddings
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Expected {expected} vectors, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Embedding request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Computes text embeddings
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds `texts`, returning vectors in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}
