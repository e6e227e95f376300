//! Shared fixtures for the integration suite

use serde_json::{json, Value};
use siphon::browser::HttpLauncher;
use siphon::config::{build_jobs, parse_config, Config};
use siphon::crawler::{BrowserPool, Scheduler};
use siphon::embedding::OllamaEmbedder;
use siphon::pipeline::Pipeline;
use siphon::store::SqliteStore;
use siphon::{CrawlJob, CrawlService};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Dimensions of the vectors returned by the mocked embedding server
pub const DIMS: usize = 4;

/// Mounts an Ollama-compatible `/api/embed` that returns one vector per input
///
/// Each vector leans towards the first letter of its text, so different
/// texts rank differently in search.
pub async fn mount_embedder(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(|request: &Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            let inputs = body["input"].as_array().cloned().unwrap_or_default();
            let embeddings: Vec<Vec<f64>> = inputs
                .iter()
                .map(|input| vector_for(input.as_str().unwrap_or_default()))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({
                "model": "test-embed",
                "embeddings": embeddings,
            }))
        })
        .mount(server)
        .await;
}

pub fn vector_for(text: &str) -> Vec<f64> {
    let mut vector = vec![0.1; DIMS];
    let slot = text.bytes().next().map_or(0, |b| usize::from(b) % DIMS);
    vector[slot] = 1.0;
    vector
}

/// Writes a complete configuration around `jobs` (raw `[[job]]` TOML)
pub fn config(dir: &TempDir, pool_size: usize, embed_endpoint: &str, jobs: &str) -> Config {
    let text = format!(
        r#"
[browser]
backend = "http"
pool-size = {pool_size}
user-data-dir = "{profiles}"
request-timeout-ms = 5000
shutdown-grace-ms = 0

[scheduler]
navigation-settle-ms = 0
network-idle-quiet-ms = 1
network-idle-ceiling-ms = 50
router-stall-warning-ms = 500

[embedding]
endpoint = "{embed_endpoint}"
model = "test-embed"
batch-size = 5

[indexing]
database-path = "{database}"
flush-interval-ms = 100

[pipeline]
batch-size = 8
batch-wait-ms = 20

{jobs}
"#,
        pool_size = pool_size,
        profiles = dir.path().join("profiles").display(),
        embed_endpoint = embed_endpoint,
        database = database_path(dir).display(),
        jobs = jobs,
    );
    parse_config(&text).unwrap()
}

pub fn database_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("index.db")
}

/// Builds the same service the CLI runs
pub async fn service(config: &Config) -> (CrawlService, BrowserPool, Vec<CrawlJob>) {
    let store = Arc::new(SqliteStore::open(Path::new(&config.indexing.database_path)).unwrap());
    let embedder = Arc::new(OllamaEmbedder::new(
        config.embedding.endpoint.clone(),
        config.embedding.model.clone(),
        config.embedding.request_timeout(),
    ));
    let pipeline = Pipeline::from_config(
        embedder,
        store,
        &config.embedding,
        &config.indexing,
        &config.pipeline,
    )
    .unwrap();

    let launcher = HttpLauncher::new(config.browser.request_timeout());
    let pool = BrowserPool::launch(&launcher, &config.browser).await.unwrap();
    let service = CrawlService::new(
        Scheduler::new(pool.clone(), config.scheduler.clone()),
        pipeline,
    );
    let jobs = build_jobs(&config.jobs, config.pipeline.channel_capacity);
    (service, pool, jobs)
}
