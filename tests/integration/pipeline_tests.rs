//! The embed-and-index pipeline against a mocked embedding server

use crate::common::{mount_embedder, vector_for};
use serde_json::{json, Value};
use siphon::document::JsonConverter;
use siphon::embedding::{Embedder, EmbeddingError, OllamaEmbedder};
use siphon::pipeline::{
    BatchConfig, BatchEmbedder, BulkIndexer, BulkSettings, ConsumerReport, Pipeline,
};
use siphon::store::{SearchStore, SqliteStore};
use siphon::{CapturedPayload, OutputRoute};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn ollama(server: &MockServer) -> Arc<OllamaEmbedder> {
    Arc::new(OllamaEmbedder::new(server.uri(), "test-embed", Duration::from_secs(5)))
}

fn pipeline(
    embedder: Arc<OllamaEmbedder>,
    store: Arc<SqliteStore>,
    embed_batch: usize,
    consume_batch: usize,
) -> Pipeline {
    Pipeline::new(
        BatchEmbedder::new(embedder, embed_batch, 2, Duration::from_secs(5)),
        BulkIndexer::new(store, BulkSettings::default()),
        BatchConfig {
            max_size: consume_batch,
            max_wait: Duration::from_millis(20),
        },
    )
}

fn titles_payload(titles: &[&str]) -> CapturedPayload {
    let items: Vec<Value> = titles
        .iter()
        .map(|title| json!({"id": title, "title": title}))
        .collect();
    CapturedPayload::new(
        "https://example.com/api/items",
        "*api/items*",
        Value::Array(items).to_string().into_bytes(),
    )
}

fn items_route() -> OutputRoute {
    OutputRoute::indexed(
        "items",
        Arc::new(
            JsonConverter::new("items")
                .with_id_field("id")
                .with_embedding_fields(vec!["title".to_string()]),
        ),
    )
}

async fn consume(pipeline: &Pipeline, payloads: Vec<CapturedPayload>) -> ConsumerReport {
    let (tx, rx) = mpsc::channel(payloads.len());
    for payload in payloads {
        tx.send(payload).await.unwrap();
    }
    drop(tx);
    pipeline.consume(items_route(), rx, CancellationToken::new()).await
}

#[tokio::test]
async fn test_ollama_embedder_returns_vectors_in_order() {
    let server = MockServer::start().await;
    mount_embedder(&server).await;

    let vectors = ollama(&server)
        .embed(&["alpha".to_string(), "bravo".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors.len(), 2);
    let expected: Vec<f32> = vector_for("bravo").iter().map(|x| *x as f32).collect();
    assert_eq!(vectors[1], expected);
}

#[tokio::test]
async fn test_ollama_embedder_reports_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;

    let result = ollama(&server).embed(&["alpha".to_string()]).await;

    match result {
        Err(EmbeddingError::Api { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "model not found");
        }
        other => panic!("expected an API error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_large_batch_is_split_into_requests() {
    let server = MockServer::start().await;
    mount_embedder(&server).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("index.db")).unwrap());
    let pipeline = pipeline(ollama(&server), store.clone(), 5, 16);

    let titles: Vec<String> = (0..12).map(|i| format!("title {}", i)).collect();
    let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
    let report = consume(&pipeline, vec![titles_payload(&refs)]).await;

    assert_eq!(report.documents_indexed, 12);
    assert_eq!(store.count("items").await.unwrap(), 12);

    let sizes: Vec<usize> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            body["input"].as_array().unwrap().len()
        })
        .collect();
    assert_eq!(sizes, vec![5, 5, 2]);
}

#[tokio::test]
async fn test_embedding_failure_skips_only_that_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(|request: &Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            let inputs = body["input"].as_array().cloned().unwrap_or_default();
            if inputs.iter().any(|input| input == "poison") {
                return ResponseTemplate::new(500).set_body_string("out of memory");
            }
            let embeddings: Vec<Vec<f64>> = inputs
                .iter()
                .map(|input| vector_for(input.as_str().unwrap_or_default()))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
        })
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("index.db")).unwrap());
    let pipeline = pipeline(ollama(&server), store.clone(), 5, 1);

    let report = consume(
        &pipeline,
        vec![
            titles_payload(&["alpha"]),
            titles_payload(&["poison"]),
            titles_payload(&["charlie", "delta"]),
        ],
    )
    .await;

    assert_eq!(report.payloads, 3);
    assert_eq!(report.batch_failures, 1);
    assert_eq!(report.documents_indexed, 3);
    assert_eq!(store.count("items").await.unwrap(), 3);
}

#[tokio::test]
async fn test_short_vector_count_fails_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [[0.1, 0.2]] })),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("index.db")).unwrap());
    let pipeline = pipeline(ollama(&server), store.clone(), 5, 4);

    let report = consume(&pipeline, vec![titles_payload(&["alpha", "bravo"])]).await;

    assert_eq!(report.batch_failures, 1);
    assert_eq!(report.documents_indexed, 0);
    assert!(store.list_indexes().await.unwrap().is_empty());
}
