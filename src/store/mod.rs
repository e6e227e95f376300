//! Search store for embedded documents
//!
//! This module handles persistence and retrieval of indexed documents,
//! including:
//! - Index creation with a fixed vector dimension and similarity
//! - Bulk upserts with per-item results
//! - Vector similarity search
//! - Per-index statistics

mod schema;
mod sqlite;
mod stats;

pub use sqlite::SqliteStore;
pub use stats::{load_statistics, print_statistics, StoreStatistics};

use crate::document::Document;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by search stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index {index} expects {expected} dimensions, got {actual}")]
    DimensionMismatch {
        index: String,
        expected: usize,
        actual: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Vector similarity used to rank search hits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Similarity {
    #[default]
    Cosine,
    DotProduct,
    L2,
}

impl Similarity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::DotProduct => "dot-product",
            Self::L2 => "l2",
        }
    }

    /// Scores `candidate` against `query`; higher is more similar
    pub fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        let dot: f32 = query.iter().zip(candidate).map(|(a, b)| a * b).sum();
        match self {
            Self::DotProduct => dot,
            Self::Cosine => {
                let norm_q = query.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_c = candidate.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_q == 0.0 || norm_c == 0.0 {
                    0.0
                } else {
                    dot / (norm_q * norm_c)
                }
            }
            Self::L2 => {
                let distance = query
                    .iter()
                    .zip(candidate)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + distance)
            }
        }
    }
}

impl FromStr for Similarity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "dot-product" => Ok(Self::DotProduct),
            "l2" => Ok(Self::L2),
            other => Err(format!("unknown similarity '{}'", other)),
        }
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    pub dims: usize,
    pub similarity: Similarity,
}

/// An index as reported by the store
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub dims: usize,
    pub similarity: Similarity,
    pub documents: u64,
    pub created_at: String,
    pub last_indexed_at: Option<String>,
}

/// Outcome of one document in a bulk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub id: String,
    pub index: String,
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-item results of a bulk request, in request order
#[derive(Debug, Clone, Default)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// One search result
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub index: String,
    pub score: f32,
    pub fields: Map<String, Value>,
}

/// A document store with vector search
#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Creates an index; returns false if it already existed
    async fn create_index(&self, schema: &IndexSchema) -> StoreResult<bool>;

    /// Inserts or replaces documents, reporting each one separately
    async fn bulk_upsert(&self, documents: &[Document]) -> StoreResult<BulkResponse>;

    /// Returns the `k` best hits among the newest `num_candidates` documents
    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
        num_candidates: usize,
    ) -> StoreResult<Vec<SearchHit>>;

    /// Number of documents in an index
    async fn count(&self, index: &str) -> StoreResult<u64>;

    async fn list_indexes(&self) -> StoreResult<Vec<IndexInfo>>;
}
