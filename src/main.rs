//! Siphon main entry point
//!
//! This is the command-line interface for the Siphon capture-and-index crawler.

use anyhow::Context;
use clap::Parser;
use siphon::browser::{BrowserLauncher, CdpLauncher, HttpLauncher};
use siphon::config::{build_jobs, load_config_with_hash, ActionEntry, BrowserBackend, Config};
use siphon::crawler::{BrowserPool, Scheduler};
use siphon::embedding::{Embedder, OllamaEmbedder};
use siphon::pipeline::Pipeline;
use siphon::store::{load_statistics, print_statistics, SearchStore, SqliteStore};
use siphon::CrawlService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Siphon: browser-driven capture feeding a streaming vector index
///
/// Siphon runs crawl jobs on a fixed pool of browser instances, captures the
/// network responses each job is interested in, and embeds and indexes them
/// as they arrive.
#[derive(Parser, Debug)]
#[command(name = "siphon")]
#[command(version)]
#[command(about = "Concurrent capture-and-index crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show the jobs without running them
    #[arg(long, conflicts_with_all = ["stats", "search"])]
    dry_run: bool,

    /// Show per-index document counts and exit
    #[arg(long, conflicts_with_all = ["dry_run", "search"])]
    stats: bool,

    /// Embed TEXT and print the closest documents
    #[arg(long, value_name = "TEXT", requires = "index")]
    search: Option<String>,

    /// Index to search
    #[arg(long, value_name = "NAME")]
    index: Option<String>,

    /// Number of hits to print
    #[arg(short, default_value_t = 10)]
    k: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config).map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config).await?;
    } else if let (Some(text), Some(index)) = (cli.search.as_deref(), cli.index.as_deref()) {
        handle_search(&config, text, index, cli.k).await?;
    } else {
        handle_crawl(config).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("siphon=info,warn"),
            1 => EnvFilter::new("siphon=debug,info"),
            2 => EnvFilter::new("siphon=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows what would be crawled
fn handle_dry_run(config: &Config) {
    println!("=== Siphon Dry Run ===\n");

    println!("Browser Pool:");
    println!("  Backend: {}", config.browser.backend);
    println!("  Instances: {}", config.browser.pool_size);
    println!("  State directory: {}", config.browser.user_data_dir);
    println!("  Headless: {}", config.browser.headless);
    println!(
        "  Debugging ports: {}..{}",
        config.browser.remote_debugging_port,
        usize::from(config.browser.remote_debugging_port) + config.browser.pool_size - 1
    );

    println!("\nEmbedding:");
    println!("  Endpoint: {}", config.embedding.endpoint);
    println!("  Model: {}", config.embedding.model);
    println!(
        "  Batch size: {}, concurrency: {}",
        config.embedding.batch_size, config.embedding.max_concurrency
    );

    println!("\nIndexing:");
    println!("  Database: {}", config.indexing.database_path);
    println!("  Similarity: {}", config.indexing.similarity);
    println!(
        "  Flush: {} bytes or {}ms",
        config.indexing.flush_bytes, config.indexing.flush_interval_ms
    );

    println!("\nJobs ({}):", config.jobs.len());
    for job in &config.jobs {
        println!("  - {}", job.url);
        for action in &job.actions {
            println!("    > {}", describe_action(action));
        }
        for intercept in &job.intercepts {
            let target = match &intercept.converter {
                Some(converter) => format!("index {}", converter.index()),
                None => "observe only".to_string(),
            };
            println!(
                "    * {} -> {} ({})",
                intercept.pattern, intercept.output, target
            );
        }
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would run {} jobs on {} browser instances",
        config.jobs.len(),
        config.browser.pool_size.min(config.jobs.len())
    );
}

fn describe_action(action: &ActionEntry) -> String {
    match action {
        ActionEntry::Click { selector, delay_ms } => {
            format!("click {} (wait {}ms)", selector, delay_ms)
        }
        ActionEntry::ClickXpath { selector, delay_ms } => {
            format!("click xpath {} (wait {}ms)", selector, delay_ms)
        }
        ActionEntry::Scroll { delta_y, delay_ms } => {
            format!("scroll {}px (wait {}ms)", delta_y, delay_ms)
        }
        ActionEntry::Evaluate {
            output, delay_ms, ..
        } => match output {
            Some(output) => format!("evaluate script -> {} (wait {}ms)", output, delay_ms),
            None => format!("evaluate script (wait {}ms)", delay_ms),
        },
    }
}

/// Handles the --stats mode: shows per-index document counts
async fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.indexing.database_path);

    let store = SqliteStore::open(Path::new(&config.indexing.database_path))?;
    let stats = load_statistics(&store).await?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --search mode: embeds the query and prints the best hits
async fn handle_search(config: &Config, text: &str, index: &str, k: usize) -> anyhow::Result<()> {
    let store = SqliteStore::open(Path::new(&config.indexing.database_path))?;
    let embedder = OllamaEmbedder::new(
        config.embedding.endpoint.clone(),
        config.embedding.model.clone(),
        config.embedding.request_timeout(),
    );

    let vector = embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .context("embedding server returned no vector for the query")?;

    let hits = store.search(index, &vector, k, k.saturating_mul(10)).await?;
    println!("=== {} hits in {} ===\n", hits.len(), index);
    for (rank, hit) in hits.iter().enumerate() {
        println!("{:>3}. {:.4}  {}", rank + 1, hit.score, hit.id);
        if let Some(title) = hit.fields.get("title").and_then(|v| v.as_str()) {
            println!("     {}", title);
        }
    }

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config) -> anyhow::Result<()> {
    let jobs = build_jobs(&config.jobs, config.pipeline.channel_capacity);
    tracing::info!(
        "{} jobs on {} browser instances",
        jobs.len(),
        config.browser.pool_size
    );

    let store = Arc::new(SqliteStore::open(Path::new(&config.indexing.database_path))?);
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
    )?;

    let launcher: Box<dyn BrowserLauncher> = match config.browser.backend {
        BrowserBackend::Chrome => Box::new(CdpLauncher::new(
            config.browser.chrome_executable.as_ref().map(PathBuf::from),
            config.browser.request_timeout(),
        )),
        BrowserBackend::Http => Box::new(HttpLauncher::new(config.browser.request_timeout())),
    };
    tracing::info!("Using the {} browser backend", config.browser.backend);
    let pool = BrowserPool::launch(&*launcher, &config.browser).await?;
    let service = CrawlService::new(Scheduler::new(pool.clone(), config.scheduler.clone()), pipeline);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping jobs");
                cancel.cancel();
            }
        })
    };

    let outcome = service.run(jobs, &cancel).await;
    interrupt.abort();
    pool.close_all().await;

    for report in &outcome.consumers {
        tracing::info!("{}", report);
    }

    match outcome.into_result() {
        Ok(()) => {
            tracing::info!("Crawl completed successfully");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}
