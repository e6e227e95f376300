use crate::document::{content_id, ConversionError, Document, DocumentConverter};
use crate::job::CapturedPayload;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Elements whose text is never content
const ALWAYS_EXCLUDED: &str = "script, style, noscript, template";

/// Converts an HTML page into one document keyed by its URL
///
/// Text is taken from elements matching `include` (the whole `<body>` when
/// empty), skipping anything inside an element matching `exclude`. When a
/// selector appears in both lists, or an included element sits inside an
/// excluded one, exclusion wins and a warning is logged.
#[derive(Debug, Clone)]
pub struct HtmlConverter {
    index: String,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl HtmlConverter {
    pub fn new(index: impl Into<String>, include: Vec<String>, exclude: Vec<String>) -> Self {
        for selector in include.iter().filter(|s| exclude.contains(s)) {
            tracing::warn!(
                "Selector '{}' is both included and excluded; it will be excluded",
                selector
            );
        }

        Self {
            index: index.into(),
            include,
            exclude,
        }
    }

    fn extract_text(&self, document: &Html, source_url: &str) -> Result<String, ConversionError> {
        let mut excluded: HashSet<_> = document.select(&parse(ALWAYS_EXCLUDED)?).map(|e| e.id()).collect();
        for selector in &self.exclude {
            excluded.extend(document.select(&parse(selector)?).map(|e| e.id()));
        }

        let roots: Vec<ElementRef> = if self.include.is_empty() {
            let body = parse("body")?;
            match document.select(&body).next() {
                Some(body) => vec![body],
                None => vec![document.root_element()],
            }
        } else {
            let mut roots = Vec::new();
            for selector in &self.include {
                roots.extend(document.select(&parse(selector)?));
            }
            roots
        };

        let mut chunks = Vec::new();
        let mut shadowed = 0usize;
        for root in roots {
            if root.ancestors().any(|a| excluded.contains(&a.id())) || excluded.contains(&root.id()) {
                shadowed += 1;
                continue;
            }

            for node in root.descendants() {
                let Node::Text(text) = node.value() else {
                    continue;
                };
                if node.ancestors().any(|a| excluded.contains(&a.id())) {
                    continue;
                }
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    chunks.push(trimmed.to_string());
                }
            }
        }

        if shadowed > 0 {
            tracing::warn!(
                "{} included elements on {} are inside excluded ones and were skipped",
                shadowed,
                source_url
            );
        }

        Ok(chunks
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "))
    }
}

fn parse(selector: &str) -> Result<Selector, ConversionError> {
    Selector::parse(selector)
        .map_err(|e| ConversionError::Other(format!("invalid selector '{}': {:?}", selector, e)))
}

fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

impl DocumentConverter for HtmlConverter {
    fn to_documents(&self, payload: &CapturedPayload) -> Result<Vec<Document>, ConversionError> {
        let html = std::str::from_utf8(&payload.body).map_err(|_| ConversionError::Encoding)?;
        let document = Html::parse_document(html);

        let title = extract_title(&document);
        let text = self.extract_text(&document, &payload.source_url)?;
        if text.is_empty() && title.is_none() {
            tracing::debug!("No text content in {}", payload.source_url);
            return Ok(Vec::new());
        }

        let embedding_text = match &title {
            Some(title) => format!("{}\n{}", title, text),
            None => text.clone(),
        };

        let mut fields = Map::new();
        fields.insert("url".to_string(), Value::String(payload.source_url.clone()));
        if let Some(title) = title {
            fields.insert("title".to_string(), Value::String(title));
        }
        fields.insert("text".to_string(), Value::String(text));

        Ok(vec![Document::new(
            content_id(&payload.source_url),
            self.index.clone(),
            fields,
            embedding_text,
        )])
    }
}
