//! Plays a job back on a leased browser
//!
//! Every blocking step races the job's cancellation token, so a cancelled
//! job stops at the next step boundary and hands control back to the worker.

use crate::browser::{Browser, BrowserError};
use crate::config::SchedulerConfig;
use crate::crawler::{JobError, JobRuntime};
use crate::job::{Action, CapturedPayload, SCROLL_SCRIPT};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs `step` unless `cancel` fires first
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: impl Future<Output = T>,
) -> Result<T, JobError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        output = step => Ok(output),
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), JobError> {
    if delay.is_zero() {
        return Ok(());
    }
    cancellable(cancel, tokio::time::sleep(delay)).await
}

/// Navigates to the job's URL and executes its actions in order
///
/// # Arguments
///
/// * `browser` - The leased browser
/// * `job` - The job, with its outputs bound
/// * `config` - Settle and network idle timing
/// * `cancel` - Cancellation shared with the worker
///
/// # Returns
///
/// * `Ok(())` - Every action ran
/// * `Err(JobError)` - The first failing step; later actions are skipped
pub async fn play(
    browser: &dyn Browser,
    job: &JobRuntime,
    config: &SchedulerConfig,
    cancel: &CancellationToken,
) -> Result<(), JobError> {
    cancellable(cancel, browser.navigate(&job.url))
        .await?
        .map_err(JobError::Navigation)?;
    pause(cancel, config.navigation_settle()).await?;

    let patterns = job.patterns();
    for (index, action) in job.actions.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        tracing::trace!("Action {} ({}) on {}", index, action.kind(), job.url);
        cancellable(cancel, execute(browser, job, index, action, cancel))
            .await?
            .map_err(|source| JobError::Action {
                index,
                kind: action.kind(),
                source,
            })?;

        wait_for_network_idle(browser, &patterns, config, cancel).await?;
        pause(cancel, action.delay()).await?;
    }

    Ok(())
}

async fn execute(
    browser: &dyn Browser,
    job: &JobRuntime,
    index: usize,
    action: &Action,
    cancel: &CancellationToken,
) -> Result<(), BrowserError> {
    match action {
        Action::Click { selector, .. } => browser.click(selector).await,
        Action::ClickXPath { selector, .. } => browser.click_xpath(selector).await,
        Action::Scroll { delta_y, .. } => browser
            .evaluate(SCROLL_SCRIPT, &[json!(delta_y)])
            .await
            .map(|_| ()),
        Action::EvaluateScript { script, args, .. } => {
            let result = browser.evaluate(script, args).await?;
            if let Some(output) = job.captures.get(&index) {
                let source_url = browser
                    .current_url()
                    .await
                    .unwrap_or_else(|_| job.url.clone());
                publish_script_result(output, source_url, index, &result, cancel).await;
            }
            Ok(())
        }
    }
}

/// Sends a script result as a payload; dropped if cancellation wins the race
async fn publish_script_result(
    output: &mpsc::Sender<CapturedPayload>,
    source_url: String,
    index: usize,
    result: &Value,
    cancel: &CancellationToken,
) {
    let payload = CapturedPayload::new(
        source_url,
        format!("script#{}", index),
        result.to_string().into_bytes(),
    );

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!("Script result of action {} dropped on cancellation", index);
        }
        sent = output.send(payload) => {
            if sent.is_err() {
                tracing::warn!("Output for action {} is closed, script result dropped", index);
            }
        }
    }
}

/// Waits for the job's traffic to go quiet, bounded by the idle ceiling
///
/// Timing out or a backend error is logged only.
async fn wait_for_network_idle(
    browser: &dyn Browser,
    patterns: &[String],
    config: &SchedulerConfig,
    cancel: &CancellationToken,
) -> Result<(), JobError> {
    let ceiling = config.network_idle_ceiling();
    let idle = browser.wait_network_idle(config.network_idle_quiet(), patterns, &[]);

    match cancellable(cancel, tokio::time::timeout(ceiling, idle)).await? {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Network idle wait failed: {}", e),
        Err(_) => tracing::debug!("Network still busy after {:?}, continuing", ceiling),
    }
    Ok(())
}
