//! Job scheduler: bounded workers over a closed job queue
//!
//! This module handles:
//! - Filling a buffered queue with every job, then closing it
//! - Running `min(pool size, job count)` workers that pull from the queue
//! - Per-job lease, interception and playback with guaranteed cleanup
//! - Collecting failures without letting one job abort another

use crate::browser::UrlPattern;
use crate::config::SchedulerConfig;
use crate::crawler::interceptor::{BoundRule, Router};
use crate::crawler::{executor, AggregateError, BrowserPool, JobError, JobFailure};
use crate::job::{Action, ActionError, CapturedPayload};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A crawl job with its output channels bound
#[derive(Debug, Clone)]
pub struct JobRuntime {
    pub url: String,
    pub actions: Vec<Action>,
    pub intercepts: Vec<BoundRule>,

    /// Output for each capturing script action, keyed by action position
    pub captures: HashMap<usize, mpsc::Sender<CapturedPayload>>,
}

impl JobRuntime {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            actions: Vec::new(),
            intercepts: Vec::new(),
            captures: HashMap::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_intercept(
        mut self,
        pattern: impl Into<UrlPattern>,
        route: impl Into<String>,
        sender: mpsc::Sender<CapturedPayload>,
    ) -> Self {
        self.intercepts.push(BoundRule {
            pattern: pattern.into(),
            route: route.into(),
            sender,
        });
        self
    }

    pub fn with_capture(mut self, index: usize, sender: mpsc::Sender<CapturedPayload>) -> Self {
        self.captures.insert(index, sender);
        self
    }

    /// Validates every action, reporting the first failure with its position
    pub fn validate(&self) -> Result<(), (usize, ActionError)> {
        for (index, action) in self.actions.iter().enumerate() {
            action.validate().map_err(|e| (index, e))?;
        }
        Ok(())
    }

    /// The job's interception patterns, used to scope network idle waits
    pub fn patterns(&self) -> Vec<String> {
        self.intercepts
            .iter()
            .map(|rule| rule.pattern.to_string())
            .collect()
    }
}

type JobQueue = Arc<Mutex<mpsc::Receiver<(usize, JobRuntime)>>>;

/// Dispatches jobs onto the browser pool
///
/// The pool is the only limit on parallelism: at most one job runs per
/// pooled instance.
pub struct Scheduler {
    pool: BrowserPool,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a new scheduler
    ///
    /// # Arguments
    ///
    /// * `pool` - The launched browser pool
    /// * `config` - Settle, network idle and router drain timing
    pub fn new(pool: BrowserPool, config: SchedulerConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    /// Runs every job to completion or failure
    ///
    /// Returns once every worker has finished. Jobs still queued when
    /// `cancel` fires are reported as cancelled.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every job succeeded
    /// * `Err(AggregateError)` - One entry per failed job, in job order
    pub async fn crawl(
        &self,
        jobs: Vec<JobRuntime>,
        cancel: &CancellationToken,
    ) -> Result<(), AggregateError> {
        let total = jobs.len();
        if total == 0 {
            tracing::info!("No jobs to run");
            return Ok(());
        }

        let (queue_tx, queue_rx) = mpsc::channel(total);
        for entry in jobs.into_iter().enumerate() {
            // Sized to the job count, so this never waits
            if queue_tx.send(entry).await.is_err() {
                break;
            }
        }
        drop(queue_tx);
        let queue: JobQueue = Arc::new(Mutex::new(queue_rx));

        let (failure_tx, mut failure_rx) = mpsc::channel(total);
        let workers = self.pool.size().min(total);
        tracing::info!("Running {} jobs on {} workers", total, workers);

        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                pool: self.pool.clone(),
                config: self.config.clone(),
                queue: Arc::clone(&queue),
                failures: failure_tx.clone(),
                cancel: cancel.clone(),
            };
            set.spawn(worker.run());
        }
        drop(failure_tx);

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        let mut failures = Vec::new();
        while let Some(failure) = failure_rx.recv().await {
            failures.push(failure);
        }

        // Jobs never dispatched because cancellation stopped the workers
        let mut remaining = queue.lock().await;
        while let Ok((index, job)) = remaining.try_recv() {
            failures.push(JobFailure {
                index,
                url: job.url,
                error: JobError::Cancelled,
            });
        }

        if failures.is_empty() {
            tracing::info!("All {} jobs completed", total);
            return Ok(());
        }

        failures.sort_by_key(|failure| failure.index);
        tracing::warn!("{} of {} jobs failed", failures.len(), total);
        Err(AggregateError { total, failures })
    }
}

struct Worker {
    id: usize,
    pool: BrowserPool,
    config: SchedulerConfig,
    queue: JobQueue,
    failures: mpsc::Sender<JobFailure>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(worker = self.id, "Worker observed cancellation");
                break;
            }

            // The queue is closed and pre-filled, so this never waits on producers
            let next = self.queue.lock().await.recv().await;
            let Some((index, job)) = next else {
                break;
            };

            let started = Instant::now();
            match self.run_job(&job).await {
                Ok(()) => tracing::info!(
                    worker = self.id,
                    "Job {} finished: {} ({:.1}s)",
                    index,
                    job.url,
                    started.elapsed().as_secs_f64()
                ),
                Err(error) => {
                    tracing::warn!(worker = self.id, "Job {} failed: {}: {}", index, job.url, error);
                    let failure = JobFailure {
                        index,
                        url: job.url.clone(),
                        error,
                    };
                    if self.failures.send(failure).await.is_err() {
                        tracing::error!("Failure collector closed before job {} reported", index);
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn run_job(&self, job: &JobRuntime) -> Result<(), JobError> {
        job.validate()?;

        let lease = self.pool.acquire(&self.cancel).await?;
        tracing::debug!(
            worker = self.id,
            instance = lease.instance_id(),
            "Acquired browser for {}",
            job.url
        );

        let mut router = Router::install(&*lease, &job.intercepts, &self.cancel)
            .await
            .map_err(JobError::Route)?;
        router.run();

        let outcome = executor::play(&*lease, job, &self.config, &self.cancel).await;

        router.stop(&*lease, self.config.router_stall_warning()).await;
        self.pool.release(lease);
        outcome
    }
}
