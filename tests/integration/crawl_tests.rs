//! Full crawls through the HTTP browser backend

use crate::common::{config, database_path, mount_embedder, service, vector_for};
use serde_json::json;
use siphon::store::{SearchStore, SqliteStore};
use siphon::SiphonError;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn item_jobs(base_url: &str, count: usize, converter: bool) -> String {
    let converter = if converter {
        r#"converter = { kind = "json", index = "items", items-pointer = "/items", id-field = "id", embedding-fields = ["title"] }"#
    } else {
        ""
    };

    (0..count)
        .map(|i| {
            format!(
                r#"
[[job]]
url = "{base}/api/items/{i}"

[[job.intercept]]
pattern = "*/api/items/*"
output = "items"
{converter}
"#,
                base = base_url,
                i = i,
                converter = converter
            )
        })
        .collect()
}

async fn mount_items(server: &MockServer, page: usize) {
    Mock::given(method("GET"))
        .and(path(format!("/api/items/{}", page)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"id": format!("{}-a", page), "title": format!("alpha {}", page)},
                {"id": format!("{}-b", page), "title": format!("bravo {}", page)},
            ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_crawl_indexes_every_intercepted_item() {
    let site = MockServer::start().await;
    let ollama = MockServer::start().await;
    mount_embedder(&ollama).await;
    for page in 0..3 {
        mount_items(&site, page).await;
    }

    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, &ollama.uri(), &item_jobs(&site.uri(), 3, true));
    let (service, pool, jobs) = service(&config).await;

    let outcome = service.run(jobs, &CancellationToken::new()).await;
    pool.close_all().await;

    assert!(outcome.failures.is_none());
    assert_eq!(outcome.documents_indexed(), 6);

    let store = SqliteStore::open(&database_path(&dir)).unwrap();
    assert_eq!(store.count("items").await.unwrap(), 6);

    // Every instance got its own state directory
    for instance in 0..2 {
        assert!(dir
            .path()
            .join("profiles")
            .join(format!("instance_{}", instance))
            .is_dir());
    }
}

#[tokio::test]
async fn test_one_failed_job_is_reported_and_others_are_indexed() {
    let site = MockServer::start().await;
    let ollama = MockServer::start().await;
    mount_embedder(&ollama).await;
    for page in [0, 1, 3] {
        mount_items(&site, page).await;
    }
    Mock::given(method("GET"))
        .and(path("/api/items/2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&site)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, 3, &ollama.uri(), &item_jobs(&site.uri(), 4, true));
    let (service, pool, jobs) = service(&config).await;

    let result = service.start_crawling(jobs, &CancellationToken::new()).await;
    pool.close_all().await;

    match result {
        Err(SiphonError::Crawl(failures)) => {
            assert_eq!(failures.total, 4);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures.failures[0].index, 2);
            assert!(failures.failures[0].url.ends_with("/api/items/2"));
        }
        other => panic!("expected exactly one failed job, got {:?}", other),
    }

    let store = SqliteStore::open(&database_path(&dir)).unwrap();
    assert_eq!(store.count("items").await.unwrap(), 6);
}

#[tokio::test]
async fn test_observe_only_output_writes_nothing() {
    let site = MockServer::start().await;
    let ollama = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&ollama)
        .await;
    for page in 0..2 {
        mount_items(&site, page).await;
    }

    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, &ollama.uri(), &item_jobs(&site.uri(), 2, false));
    let (service, pool, jobs) = service(&config).await;

    let outcome = service.run(jobs, &CancellationToken::new()).await;
    pool.close_all().await;

    assert!(outcome.failures.is_none());
    assert_eq!(outcome.consumers.len(), 1);
    assert_eq!(outcome.consumers[0].payloads, 2);
    assert_eq!(outcome.consumers[0].observed, 2);

    let store = SqliteStore::open(&database_path(&dir)).unwrap();
    assert!(store.list_indexes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_html_page_is_searchable() {
    let site = MockServer::start().await;
    let ollama = MockServer::start().await;
    mount_embedder(&ollama).await;
    Mock::given(method("GET"))
        .and(path("/guide"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(
                    r#"<html><head><title>Field Guide</title></head><body>
                    <nav>Home | About</nav>
                    <main>alpine meadows and their flowers</main>
                    <script>track()</script>
                    </body></html>"#,
                )
                .insert_header("content-type", "text/html"),
        )
        .mount(&site)
        .await;

    let jobs = format!(
        r#"
[[job]]
url = "{}/guide"

[[job.intercept]]
pattern = "*/guide"
output = "pages"
converter = {{ kind = "html", index = "pages", exclude = ["nav"] }}
"#,
        site.uri()
    );

    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1, &ollama.uri(), &jobs);
    let (service, pool, jobs) = service(&config).await;

    service
        .start_crawling(jobs, &CancellationToken::new())
        .await
        .unwrap();
    pool.close_all().await;

    let store = SqliteStore::open(&database_path(&dir)).unwrap();
    let query: Vec<f32> = vector_for("Field Guide").iter().map(|x| *x as f32).collect();
    let hits = store.search("pages", &query, 5, 50).await.unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fields["title"], json!("Field Guide"));
    let text = hits[0].fields["text"].as_str().unwrap();
    assert!(text.contains("alpine meadows"));
    assert!(!text.contains("About"));
    assert!(!text.contains("track()"));
}

#[tokio::test]
async fn test_cancelled_crawl_returns_every_instance() {
    let site = MockServer::start().await;
    let ollama = MockServer::start().await;
    mount_embedder(&ollama).await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": []}))
                .set_delay(std::time::Duration::from_secs(2)),
        )
        .mount(&site)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, &ollama.uri(), &item_jobs(&site.uri(), 5, true));
    let (service, pool, jobs) = service(&config).await;

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let outcome = service.run(jobs, &cancel).await;
    canceller.await.unwrap();

    let failures = outcome.failures.expect("cancelled jobs are reported");
    assert_eq!(failures.len(), 5);
    assert!(failures.only_cancelled());
    assert_eq!(pool.available(), 2);
    pool.close_all().await;
}
