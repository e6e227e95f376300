//! Documents and the converters that produce them
//!
//! A converter turns one `CapturedPayload` into zero or more documents. Each
//! document names its target index and the text its embedding is computed
//! from; the embedding itself is filled in by the pipeline before indexing.

mod html;
mod json;

pub use html::HtmlConverter;
pub use json::JsonConverter;

use crate::job::CapturedPayload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while converting a payload
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    Encoding,

    #[error("Nothing at {pointer} in payload from {source_url}")]
    MissingPointer { pointer: String, source_url: String },

    #[error("Expected {expected} in payload, found {found}")]
    Shape {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0}")]
    Other(String),
}

/// A unit of indexable content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier; indexing the same id again replaces the document
    pub id: String,

    /// Target index
    pub index: String,

    pub fields: Map<String, Value>,

    /// Text the embedding is computed from
    pub embedding_text: String,

    /// Populated by the pipeline; never indexed while `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        index: impl Into<String>,
        fields: Map<String, Value>,
        embedding_text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            index: index.into(),
            fields,
            embedding_text: embedding_text.into(),
            embedding: None,
        }
    }

    pub fn set_embedding(&mut self, embedding: Vec<f32>) {
        self.embedding = Some(embedding);
    }

    pub fn is_embedded(&self) -> bool {
        self.embedding.is_some()
    }

    /// Approximate size of the document once serialized, for flush accounting
    pub fn encoded_len(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|(key, value)| key.len() + value.to_string().len())
            .sum();
        let vector = self.embedding.as_ref().map_or(0, |v| v.len() * 4);
        self.id.len() + self.index.len() + self.embedding_text.len() + fields + vector
    }
}

/// Turns a captured payload into documents
pub trait DocumentConverter: Send + Sync {
    fn to_documents(&self, payload: &CapturedPayload) -> Result<Vec<Document>, ConversionError>;
}

impl<F> DocumentConverter for F
where
    F: Fn(&CapturedPayload) -> Result<Vec<Document>, ConversionError> + Send + Sync,
{
    fn to_documents(&self, payload: &CapturedPayload) -> Result<Vec<Document>, ConversionError> {
        self(payload)
    }
}

/// Hex-encoded SHA-256 of `input`, used for derived document ids
pub fn content_id(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
