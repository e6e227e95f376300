use crate::config::jobs::{ActionEntry, ConverterEntry, InterceptEntry, JobEntry};
use crate::config::types::{
    BrowserBackend, BrowserConfig, Config, EmbeddingConfig, IndexingConfig, PipelineConfig,
    SchedulerConfig,
};
use crate::store::Similarity;
use crate::ConfigError;
use std::collections::HashMap;
use std::str::FromStr;
use url::Url;

/// Largest pool the launcher accepts
pub const MAX_POOL_SIZE: usize = 32;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_browser_config(&config.browser)?;
    validate_scheduler_config(&config.scheduler)?;
    validate_embedding_config(&config.embedding)?;
    validate_indexing_config(&config.indexing)?;
    validate_pipeline_config(&config.pipeline)?;
    validate_jobs(&config.jobs)?;
    validate_backend_support(config.browser.backend, &config.jobs)?;
    Ok(())
}

/// Rejects jobs whose actions the configured backend cannot run
fn validate_backend_support(backend: BrowserBackend, jobs: &[JobEntry]) -> Result<(), ConfigError> {
    if backend.runs_actions() {
        return Ok(());
    }

    match jobs.iter().enumerate().find(|(_, job)| !job.actions.is_empty()) {
        Some((position, job)) => Err(ConfigError::Validation(format!(
            "job {} ({}) declares actions, which the {} backend cannot run; use backend = \"chrome\"",
            position, job.url, backend
        ))),
        None => Ok(()),
    }
}

/// Validates browser pool configuration
fn validate_browser_config(config: &BrowserConfig) -> Result<(), ConfigError> {
    if config.pool_size < 1 || config.pool_size > MAX_POOL_SIZE {
        return Err(ConfigError::Validation(format!(
            "pool_size must be between 1 and {}, got {}",
            MAX_POOL_SIZE, config.pool_size
        )));
    }

    if config.user_data_dir.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_data_dir cannot be empty".to_string(),
        ));
    }

    if usize::from(config.remote_debugging_port) + config.pool_size > usize::from(u16::MAX) {
        return Err(ConfigError::Validation(format!(
            "remote_debugging_port {} leaves no room for {} instances",
            config.remote_debugging_port, config.pool_size
        )));
    }

    require_positive("request_timeout_ms", config.request_timeout_ms)?;
    if let Some(timeout) = config.acquire_timeout_ms {
        require_positive("acquire_timeout_ms", timeout)?;
    }

    Ok(())
}

/// Validates scheduler timing
fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    require_positive("network_idle_quiet_ms", config.network_idle_quiet_ms)?;
    require_positive("network_idle_ceiling_ms", config.network_idle_ceiling_ms)?;
    require_positive("router_stall_warning_ms", config.router_stall_warning_ms)?;

    if config.network_idle_ceiling_ms < config.network_idle_quiet_ms {
        return Err(ConfigError::Validation(format!(
            "network_idle_ceiling_ms ({}) must be >= network_idle_quiet_ms ({})",
            config.network_idle_ceiling_ms, config.network_idle_quiet_ms
        )));
    }

    Ok(())
}

/// Validates embedding backend configuration
fn validate_embedding_config(config: &EmbeddingConfig) -> Result<(), ConfigError> {
    let endpoint = Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid embedding endpoint: {}", e)))?;
    require_http_scheme(&endpoint, &config.endpoint)?;

    if config.model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "embedding model cannot be empty".to_string(),
        ));
    }

    if config.batch_size < 1 {
        return Err(ConfigError::Validation(
            "embedding batch_size must be >= 1".to_string(),
        ));
    }

    if config.max_concurrency < 1 {
        return Err(ConfigError::Validation(
            "embedding max_concurrency must be >= 1".to_string(),
        ));
    }

    require_positive("permit_timeout_ms", config.permit_timeout_ms)?;
    require_positive("request_timeout_ms", config.request_timeout_ms)?;
    Ok(())
}

/// Validates store and bulk indexing configuration
fn validate_indexing_config(config: &IndexingConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.flush_bytes < 1024 {
        return Err(ConfigError::Validation(format!(
            "flush_bytes must be >= 1024, got {}",
            config.flush_bytes
        )));
    }

    require_positive("flush_interval_ms", config.flush_interval_ms)?;
    require_positive("operation_timeout_ms", config.operation_timeout_ms)?;

    Similarity::from_str(&config.similarity).map_err(|_| {
        ConfigError::Validation(format!(
            "similarity must be one of cosine, dot-product, l2; got '{}'",
            config.similarity
        ))
    })?;

    Ok(())
}

/// Validates consumer batching
fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 {
        return Err(ConfigError::Validation(
            "pipeline batch_size must be >= 1".to_string(),
        ));
    }

    if config.channel_capacity < 1 {
        return Err(ConfigError::Validation(
            "channel_capacity must be >= 1".to_string(),
        ));
    }

    require_positive("batch_wait_ms", config.batch_wait_ms)
}

/// Validates job entries and checks that shared outputs agree
fn validate_jobs(jobs: &[JobEntry]) -> Result<(), ConfigError> {
    let mut outputs: HashMap<&str, Option<&ConverterEntry>> = HashMap::new();

    for (position, job) in jobs.iter().enumerate() {
        let url = Url::parse(&job.url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid job URL '{}': {}", job.url, e))
        })?;
        require_http_scheme(&url, &job.url)?;

        for (index, action) in job.actions.iter().enumerate() {
            validate_action(position, index, action)?;

            if let ActionEntry::Evaluate {
                output: Some(name),
                converter,
                ..
            } = action
            {
                register_output(&mut outputs, name, converter.as_ref())?;
            }
        }

        for intercept in &job.intercepts {
            validate_intercept(position, intercept)?;
            register_output(&mut outputs, &intercept.output, intercept.converter.as_ref())?;
        }
    }

    Ok(())
}

fn validate_action(job: usize, index: usize, action: &ActionEntry) -> Result<(), ConfigError> {
    let problem = match action {
        ActionEntry::Click { selector, .. } | ActionEntry::ClickXpath { selector, .. }
            if selector.trim().is_empty() =>
        {
            Some("selector cannot be empty")
        }
        ActionEntry::Scroll { delta_y: 0, .. } => Some("delta-y cannot be zero"),
        ActionEntry::Evaluate { script, .. } if script.trim().is_empty() => {
            Some("script cannot be empty")
        }
        ActionEntry::Evaluate {
            output: None,
            converter: Some(_),
            ..
        } => Some("converter requires an output"),
        _ => None,
    };

    match problem {
        Some(message) => Err(ConfigError::Validation(format!(
            "job {} action {}: {}",
            job, index, message
        ))),
        None => Ok(()),
    }
}

fn validate_intercept(job: usize, intercept: &InterceptEntry) -> Result<(), ConfigError> {
    if intercept.pattern.trim().is_empty() {
        return Err(ConfigError::InvalidPattern(format!(
            "job {}: intercept pattern cannot be empty",
            job
        )));
    }

    if intercept.output.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "job {}: intercept output cannot be empty",
            job
        )));
    }

    if intercept.capacity == Some(0) {
        return Err(ConfigError::Validation(format!(
            "job {}: output '{}' capacity must be >= 1",
            job, intercept.output
        )));
    }

    Ok(())
}

fn validate_converter(converter: &ConverterEntry) -> Result<(), ConfigError> {
    if converter.index().trim().is_empty() {
        return Err(ConfigError::Validation(
            "converter index cannot be empty".to_string(),
        ));
    }

    match converter {
        ConverterEntry::Json {
            items_pointer: Some(pointer),
            ..
        } if !pointer.is_empty() && !pointer.starts_with('/') => {
            Err(ConfigError::Validation(format!(
                "items-pointer '{}' must be empty or start with '/'",
                pointer
            )))
        }
        ConverterEntry::Html {
            include, exclude, ..
        } => {
            for selector in include.iter().chain(exclude) {
                scraper::Selector::parse(selector).map_err(|_| {
                    ConfigError::Validation(format!("invalid CSS selector '{}'", selector))
                })?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Records an output's converter, rejecting a name declared twice differently
fn register_output<'a>(
    outputs: &mut HashMap<&'a str, Option<&'a ConverterEntry>>,
    name: &'a str,
    converter: Option<&'a ConverterEntry>,
) -> Result<(), ConfigError> {
    if let Some(converter) = converter {
        validate_converter(converter)?;
    }

    match outputs.get(name) {
        Some(existing) if *existing != converter => Err(ConfigError::Validation(format!(
            "output '{}' is declared with different converters",
            name
        ))),
        Some(_) => Ok(()),
        None => {
            outputs.insert(name, converter);
            Ok(())
        }
    }
}

fn require_positive(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{} must be >= 1", name)));
    }
    Ok(())
}

fn require_http_scheme(url: &Url, raw: &str) -> Result<(), ConfigError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl(format!(
            "URL '{}' must use http or https, got '{}'",
            raw, other
        ))),
    }
}
