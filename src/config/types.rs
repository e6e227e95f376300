use crate::config::jobs::JobEntry;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Main configuration structure for Siphon
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub browser: BrowserConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobEntry>,
}

/// Engine behind every pool slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserBackend {
    /// Chrome driven over the DevTools protocol
    #[default]
    Chrome,

    /// Plain HTTP fetches; navigation and hijacking only
    Http,
}

impl BrowserBackend {
    /// Whether clicks, scrolls and scripts can run on this backend
    pub fn runs_actions(self) -> bool {
        matches!(self, Self::Chrome)
    }
}

impl fmt::Display for BrowserBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chrome => write!(f, "chrome"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Browser pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub backend: BrowserBackend,

    /// Chrome binary to launch; looked up on the system when absent
    #[serde(default, rename = "chrome-executable")]
    pub chrome_executable: Option<String>,

    /// Number of browser instances launched up front
    #[serde(rename = "pool-size")]
    pub pool_size: usize,

    /// Root directory; each instance gets `instance_{i}` below it
    #[serde(rename = "user-data-dir")]
    pub user_data_dir: String,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default, rename = "user-agent")]
    pub user_agent: Option<String>,

    /// Port of instance 0; instance `i` listens on `base + i`
    #[serde(default = "default_debugging_port", rename = "remote-debugging-port")]
    pub remote_debugging_port: u16,

    #[serde(default = "default_request_timeout_ms", rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,

    /// Upper bound on waiting for a free instance (unbounded when absent)
    #[serde(default, rename = "acquire-timeout-ms")]
    pub acquire_timeout_ms: Option<u64>,

    /// Time in-flight jobs get to publish their last events before teardown
    #[serde(default = "default_shutdown_grace_ms", rename = "shutdown-grace-ms")]
    pub shutdown_grace_ms: u64,
}

impl BrowserConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Per-job timing used by the scheduler's workers
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Pause after navigation before the first action
    #[serde(default = "default_navigation_settle_ms", rename = "navigation-settle-ms")]
    pub navigation_settle_ms: u64,

    /// Quiet window that counts as network idle
    #[serde(default = "default_idle_quiet_ms", rename = "network-idle-quiet-ms")]
    pub network_idle_quiet_ms: u64,

    /// Longest time spent waiting for network idle after an action
    #[serde(default = "default_idle_ceiling_ms", rename = "network-idle-ceiling-ms")]
    pub network_idle_ceiling_ms: u64,

    /// How often a stopping router warns while full outputs hold it back
    #[serde(
        default = "default_router_stall_warning_ms",
        rename = "router-stall-warning-ms"
    )]
    pub router_stall_warning_ms: u64,
}

impl SchedulerConfig {
    pub fn navigation_settle(&self) -> Duration {
        Duration::from_millis(self.navigation_settle_ms)
    }

    pub fn network_idle_quiet(&self) -> Duration {
        Duration::from_millis(self.network_idle_quiet_ms)
    }

    pub fn network_idle_ceiling(&self) -> Duration {
        Duration::from_millis(self.network_idle_ceiling_ms)
    }

    pub fn router_stall_warning(&self) -> Duration {
        Duration::from_millis(self.router_stall_warning_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            navigation_settle_ms: default_navigation_settle_ms(),
            network_idle_quiet_ms: default_idle_quiet_ms(),
            network_idle_ceiling_ms: default_idle_ceiling_ms(),
            router_stall_warning_ms: default_router_stall_warning_ms(),
        }
    }
}

/// Embedding backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding server
    pub endpoint: String,

    pub model: String,

    /// Maximum number of texts sent in one embedding call
    #[serde(default = "default_embedding_batch_size", rename = "batch-size")]
    pub batch_size: usize,

    /// Embedding calls allowed in flight at once
    #[serde(default = "default_max_concurrency", rename = "max-concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_permit_timeout_ms", rename = "permit-timeout-ms")]
    pub permit_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms", rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl EmbeddingConfig {
    pub fn permit_timeout(&self) -> Duration {
        Duration::from_millis(self.permit_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Search store and bulk indexing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Buffered bytes that trigger a flush
    #[serde(default = "default_flush_bytes", rename = "flush-bytes")]
    pub flush_bytes: usize,

    #[serde(default = "default_flush_interval_ms", rename = "flush-interval-ms")]
    pub flush_interval_ms: u64,

    /// Limit on one whole bulk operation
    #[serde(default = "default_operation_timeout_ms", rename = "operation-timeout-ms")]
    pub operation_timeout_ms: u64,

    /// Similarity used when an index is created ("cosine", "dot-product" or "l2")
    #[serde(default = "default_similarity")]
    pub similarity: String,
}

impl IndexingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Consumer batching configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Payloads grouped into one consumer batch
    #[serde(default = "default_pipeline_batch_size", rename = "batch-size")]
    pub batch_size: usize,

    /// Longest time a partial batch waits for more payloads
    #[serde(default = "default_batch_wait_ms", rename = "batch-wait-ms")]
    pub batch_wait_ms: u64,

    /// Default capacity of output channels that do not set their own
    #[serde(default = "default_channel_capacity", rename = "channel-capacity")]
    pub channel_capacity: usize,
}

impl PipelineConfig {
    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_pipeline_batch_size(),
            batch_wait_ms: default_batch_wait_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_debugging_port() -> u16 {
    9222
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    3_000
}

fn default_navigation_settle_ms() -> u64 {
    2_000
}

fn default_idle_quiet_ms() -> u64 {
    500
}

fn default_idle_ceiling_ms() -> u64 {
    10_000
}

fn default_router_stall_warning_ms() -> u64 {
    1_000
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_max_concurrency() -> usize {
    4
}

fn default_permit_timeout_ms() -> u64 {
    30_000
}

fn default_flush_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_similarity() -> String {
    "cosine".to_string()
}

fn default_pipeline_batch_size() -> usize {
    16
}

fn default_batch_wait_ms() -> u64 {
    200
}

fn default_channel_capacity() -> usize {
    crate::job::DEFAULT_CHANNEL_CAPACITY
}
