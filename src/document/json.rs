use crate::document::{content_id, value_kind, ConversionError, Document, DocumentConverter};
use crate::job::CapturedPayload;
use serde_json::{Map, Value};

/// Converts JSON payloads into one document per item
///
/// Items are found at `items_pointer` (a JSON pointer; the root when unset).
/// An array yields one document per element, an object yields one document.
/// Non-object items are wrapped as `{"value": item}`.
#[derive(Debug, Clone)]
pub struct JsonConverter {
    index: String,
    items_pointer: Option<String>,
    id_field: Option<String>,
    embedding_fields: Vec<String>,
}

impl JsonConverter {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            items_pointer: None,
            id_field: None,
            embedding_fields: Vec::new(),
        }
    }

    pub fn with_items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = Some(pointer.into());
        self
    }

    /// Field whose value becomes the document id
    ///
    /// Items without it get an id derived from source URL, position and content.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Fields joined (in this order) to form the embedding text
    ///
    /// When empty, the whole item serialized as JSON is embedded.
    pub fn with_embedding_fields(mut self, fields: Vec<String>) -> Self {
        self.embedding_fields = fields;
        self
    }

    fn item_id(&self, item: &Map<String, Value>, payload: &CapturedPayload, position: usize) -> String {
        let explicit = self
            .id_field
            .as_deref()
            .and_then(|field| item.get(field))
            .and_then(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        explicit.unwrap_or_else(|| {
            content_id(&format!(
                "{}#{}#{}",
                payload.source_url,
                position,
                Value::Object(item.clone())
            ))
        })
    }

    fn embedding_text(&self, item: &Map<String, Value>) -> String {
        if self.embedding_fields.is_empty() {
            return Value::Object(item.clone()).to_string();
        }

        self.embedding_fields
            .iter()
            .filter_map(|field| item.get(field))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DocumentConverter for JsonConverter {
    fn to_documents(&self, payload: &CapturedPayload) -> Result<Vec<Document>, ConversionError> {
        let root: Value = serde_json::from_slice(&payload.body)?;

        let items = match self.items_pointer.as_deref() {
            None | Some("") => &root,
            Some(pointer) => root
                .pointer(pointer)
                .ok_or_else(|| ConversionError::MissingPointer {
                    pointer: pointer.to_string(),
                    source_url: payload.source_url.clone(),
                })?,
        };

        let items: Vec<Value> = match items {
            Value::Array(values) => values.clone(),
            Value::Object(_) => vec![items.clone()],
            Value::Null => Vec::new(),
            other => {
                return Err(ConversionError::Shape {
                    expected: "an array or an object",
                    found: value_kind(other),
                })
            }
        };

        let documents = items
            .into_iter()
            .enumerate()
            .map(|(position, item)| {
                let fields = match item {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                let id = self.item_id(&fields, payload, position);
                let text = self.embedding_text(&fields);
                Document::new(id, self.index.clone(), fields, text)
            })
            .collect();

        Ok(documents)
    }
}
