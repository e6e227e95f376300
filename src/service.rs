//! Crawl service: the scheduler and the pipeline wired together
//!
//! The service owns every output channel. It creates one bounded channel and
//! one consumer per distinct output route, binds each job's rules to the
//! channel senders, runs the scheduler, and then drops its own senders so
//! that each consumer sees its channel close once the last job has finished.

use crate::crawler::{AggregateError, JobRuntime, Scheduler};
use crate::job::{Action, CapturedPayload, CrawlJob, OutputRoute};
use crate::pipeline::{ConsumerReport, Pipeline};
use crate::SiphonError;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a full crawl produced
#[derive(Debug)]
pub struct CrawlOutcome {
    /// Failed jobs, if any
    pub failures: Option<AggregateError>,

    /// One report per output route, ordered by route name
    pub consumers: Vec<ConsumerReport>,
}

impl CrawlOutcome {
    pub fn documents_indexed(&self) -> usize {
        self.consumers.iter().map(|c| c.documents_indexed).sum()
    }

    pub fn into_result(self) -> crate::Result<()> {
        match self.failures {
            Some(failures) => Err(SiphonError::Crawl(failures)),
            None => Ok(()),
        }
    }
}

pub struct CrawlService {
    scheduler: Scheduler,
    pipeline: Pipeline,
}

impl CrawlService {
    pub fn new(scheduler: Scheduler, pipeline: Pipeline) -> Self {
        Self {
            scheduler,
            pipeline,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Crawls every job and waits until everything captured has been
    /// persisted or logged
    ///
    /// # Arguments
    ///
    /// * `jobs` - The jobs to run; output routes with the same name share one
    ///   channel and one consumer
    /// * `cancel` - Stops dispatch, in-flight jobs and consumers
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Every job succeeded
    /// * `Err(SiphonError::Crawl)` - One aggregate error listing each failed job
    pub async fn start_crawling(
        &self,
        jobs: Vec<CrawlJob>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.run(jobs, cancel).await.into_result()
    }

    /// Like `start_crawling`, but also returns the consumer reports
    pub async fn run(&self, jobs: Vec<CrawlJob>, cancel: &CancellationToken) -> CrawlOutcome {
        let routes = collect_routes(&jobs);

        let mut senders: HashMap<String, mpsc::Sender<CapturedPayload>> = HashMap::new();
        let mut consumers = Vec::with_capacity(routes.len());
        for route in routes {
            let (tx, rx) = mpsc::channel(route.capacity.max(1));
            senders.insert(route.name.clone(), tx);
            consumers.push(self.pipeline.spawn_consumer(route, rx, cancel.clone()));
        }
        info!(
            "Starting {} jobs with {} output channels",
            jobs.len(),
            senders.len()
        );

        let runtimes: Vec<JobRuntime> = jobs.iter().map(|job| bind(job, &senders)).collect();
        // Jobs now hold the only remaining senders
        drop(senders);

        let failures = self.scheduler.crawl(runtimes, cancel).await.err();
        if let Some(failures) = &failures {
            warn!("{}", failures);
        }

        let mut reports = Vec::with_capacity(consumers.len());
        for handle in consumers {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Consumer task failed: {}", e),
            }
        }
        reports.sort_by(|a, b| a.route.cmp(&b.route));

        let outcome = CrawlOutcome {
            failures,
            consumers: reports,
        };
        info!(
            "Crawl finished: {} documents indexed across {} channels",
            outcome.documents_indexed(),
            outcome.consumers.len()
        );
        outcome
    }
}

/// Distinct output routes across all jobs, first declaration wins
fn collect_routes(jobs: &[CrawlJob]) -> Vec<OutputRoute> {
    let mut routes: Vec<OutputRoute> = Vec::new();

    let declared = jobs.iter().flat_map(|job| {
        let intercepts = job.intercepts.iter().map(|rule| &rule.route);
        intercepts.chain(job.actions.iter().filter_map(Action::capture))
    });

    for route in declared {
        match routes.iter().find(|known| known.name == route.name) {
            None => routes.push(route.clone()),
            Some(known) if !known.same_converter(route) => {
                warn!(
                    "Output {} is declared with different converters; using the first",
                    route.name
                );
            }
            Some(_) => {}
        }
    }

    routes
}

fn bind(job: &CrawlJob, senders: &HashMap<String, mpsc::Sender<CapturedPayload>>) -> JobRuntime {
    let mut runtime = JobRuntime::new(job.url.clone());

    for (index, action) in job.actions.iter().enumerate() {
        if let Some(sender) = action.capture().and_then(|route| senders.get(&route.name)) {
            runtime = runtime.with_capture(index, sender.clone());
        }
        runtime = runtime.with_action(action.clone());
    }

    for rule in &job.intercepts {
        if let Some(sender) = senders.get(&rule.route.name) {
            runtime = runtime.with_intercept(
                rule.pattern.clone(),
                rule.route.name.clone(),
                sender.clone(),
            );
        }
    }

    debug!(
        url = %runtime.url,
        "Bound {} actions and {} intercepts",
        runtime.actions.len(),
        runtime.intercepts.len()
    );
    runtime
}
