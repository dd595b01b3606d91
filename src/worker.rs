//! Worker loop: reclaim orphans, claim a batch, run it, record outcomes.
//!
//! One cycle claims up to `batch_size` jobs and runs them concurrently, so
//! the batch size is also the concurrency bound. A cycle that found work is
//! followed immediately by another; an empty cycle sleeps for the poll
//! interval unless kicked. Shutdown is observed between cycles only, so a
//! claimed job always reaches a terminal or retry state before the loop
//! returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Job, JobError, JobStatus};
use crate::processor::{DispatchError, HandlerError, Processor};
use crate::store::JobStore;
use crate::telemetry::job::{record_outcome, start_job_span};
use crate::telemetry::metrics;

/// Shortest interval between lease renewals.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after a cycle that claimed nothing.
    pub poll_interval: Duration,
    /// Claim limit per cycle, and therefore the concurrency bound.
    pub batch_size: usize,
    /// Per-job execution limit. `None` lets handlers run indefinitely,
    /// bounded only by the lease heartbeat.
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2_000),
            batch_size: 5,
            job_timeout: None,
        }
    }
}

/// Wakes an idle worker so it polls right away.
#[derive(Clone)]
pub struct Kicker(Arc<Notify>);

impl Kicker {
    pub fn kick(&self) {
        self.0.notify_one();
    }
}

/// How one attempt ended after finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Retried,
    Failed,
}

impl AttemptOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Retried => "retried",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Attempts whose outcome could not be written back. Their jobs stay
    /// `running` until the lease expires.
    pub unrecorded: usize,
}

/// Shared by the cycle and the tasks it spawns.
struct Executor {
    store: Arc<dyn JobStore>,
    processor: Arc<Processor>,
    job_timeout: Option<Duration>,
    renew_every: Duration,
}

/// The polling worker.
pub struct Worker {
    executor: Arc<Executor>,
    config: WorkerConfig,
    kick: Arc<Notify>,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, processor: Arc<Processor>, config: WorkerConfig) -> Self {
        let renew_every = (store.settings().lease_duration / 3).max(MIN_RENEW_INTERVAL);
        Self {
            executor: Arc::new(Executor {
                store,
                processor,
                job_timeout: config.job_timeout,
                renew_every,
            }),
            config,
            kick: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle for producers in this process (or a notification listener)
    /// to cut the idle sleep short.
    pub fn kicker(&self) -> Kicker {
        Kicker(Arc::clone(&self.kick))
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Store failures are logged and retried after the poll interval; they
    /// never end the loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if report.claimed > 0 => {
                    debug!(?report, "cycle finished, polling again");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "worker cycle failed, retrying after poll interval");
                    metrics::worker_cycles().add(1, &[KeyValue::new("result", "error")]);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.kick.notified() => debug!("worker kicked"),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("worker stopped");
    }

    /// One reclaim → claim → execute → finalize pass.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let store = &self.executor.store;
        let mut report = CycleReport::default();

        let reclaimed = store.reclaim_expired().await.inspect_err(|_| {
            metrics::store_errors().add(1, &[KeyValue::new("operation", "reclaim")]);
        })?;
        for job in &reclaimed {
            warn!(
                "job.id" = %job.id,
                "job.type" = %job.job_type,
                status = %job.status,
                attempts = job.attempts,
                "reclaimed job with expired lease"
            );
        }
        report.reclaimed = reclaimed.len();
        if !reclaimed.is_empty() {
            metrics::leases_reclaimed().add(reclaimed.len() as u64, &[]);
        }

        let jobs = store
            .claim_batch(self.config.batch_size)
            .await
            .inspect_err(|_| {
                metrics::store_errors().add(1, &[KeyValue::new("operation", "claim")]);
            })?;
        report.claimed = jobs.len();

        if jobs.is_empty() {
            metrics::worker_cycles().add(1, &[KeyValue::new("result", "empty")]);
            return Ok(report);
        }
        metrics::worker_cycles().add(1, &[KeyValue::new("result", "jobs")]);

        let mut tasks = JoinSet::new();
        for job in jobs {
            metrics::jobs_claimed().add(1, &[KeyValue::new("job_type", job.job_type.as_str())]);
            let executor = Arc::clone(&self.executor);
            let span = start_job_span(&job);
            tasks.spawn(async move { executor.execute(job).await }.instrument(span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(AttemptOutcome::Succeeded)) => report.succeeded += 1,
                Ok(Ok(AttemptOutcome::Retried)) => report.retried += 1,
                Ok(Ok(AttemptOutcome::Failed)) => report.failed += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "could not record job outcome");
                    report.unrecorded += 1;
                }
                Err(e) => {
                    error!(error = %e, "job task aborted");
                    report.unrecorded += 1;
                }
            }
        }

        info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            "cycle complete"
        );
        Ok(report)
    }
}

impl Executor {
    /// Run one claimed job and write its outcome back.
    async fn execute(&self, job: Job) -> Result<AttemptOutcome> {
        let span = tracing::Span::current();
        let started = Instant::now();
        info!("job started");

        let work = self.dispatch(&job);
        tokio::pin!(work);
        let mut renew = tokio::time::interval_at(
            tokio::time::Instant::now() + self.renew_every,
            self.renew_every,
        );
        let outcome = loop {
            tokio::select! {
                out = &mut work => break out,
                _ = renew.tick() => self.renew(&job).await,
            }
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::job_duration_ms().record(
            duration_ms,
            &[KeyValue::new("job_type", job.job_type.as_str())],
        );

        let finalized = match outcome {
            Ok(result) => {
                info!(duration_ms, "job succeeded");
                self.store
                    .mark_succeeded(job.id, job.attempts, result)
                    .await
                    .map(|_| AttemptOutcome::Succeeded)
            }
            Err(DispatchError::Unsupported(job_type)) => {
                let err = Error::UnsupportedJobType(job_type.to_string());
                error!(error = %err, "no handler registered, failing job");
                self.store
                    .mark_failed(job.id, job.attempts, JobError::new(err.to_string()))
                    .await
                    .map(|_| AttemptOutcome::Failed)
            }
            Err(DispatchError::Handler(e)) if e.permanent => {
                warn!(error = %e, cause = ?e.cause, duration_ms, "job failed permanently");
                self.store
                    .mark_failed(job.id, job.attempts, e.to_job_error())
                    .await
                    .map(|_| AttemptOutcome::Failed)
            }
            Err(DispatchError::Handler(e)) => {
                warn!(error = %e, cause = ?e.cause, duration_ms, "job attempt failed");
                self.store
                    .mark_failed_or_retry(job.id, job.attempts, e.to_job_error())
                    .await
                    .map(|stored| match stored.status {
                        JobStatus::Queued => AttemptOutcome::Retried,
                        JobStatus::Succeeded => AttemptOutcome::Succeeded,
                        JobStatus::Failed | JobStatus::Running => AttemptOutcome::Failed,
                    })
            }
        };

        let outcome = finalized.inspect_err(|_| {
            metrics::store_errors().add(1, &[KeyValue::new("operation", "finalize")]);
        })?;
        record_outcome(&span, JobStatus::Running.as_str(), outcome.as_str());
        metrics::job_outcomes().add(
            1,
            &[
                KeyValue::new("job_type", job.job_type.as_str()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
        Ok(outcome)
    }

    /// Call the handler on its own task so a panic or timeout becomes a
    /// handler error instead of taking the worker down.
    async fn dispatch(&self, job: &Job) -> std::result::Result<serde_json::Value, DispatchError> {
        let processor = Arc::clone(&self.processor);
        let owned = job.clone();
        let mut handle = tokio::spawn(
            async move { processor.process(&owned).await }.instrument(tracing::Span::current()),
        );

        let joined = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(HandlerError::retryable(format!(
                        "job timed out after {}ms",
                        limit.as_millis()
                    ))
                    .into());
                }
            },
            None => (&mut handle).await,
        };

        joined.unwrap_or_else(|e| {
            Err(HandlerError::retryable("handler panicked")
                .with_cause(e.to_string())
                .into())
        })
    }

    async fn renew(&self, job: &Job) {
        match self.store.renew_lease(job.id, job.attempts).await {
            Ok(true) => debug!("lease renewed"),
            Ok(false) => warn!("lease lost, job is no longer running"),
            Err(e) => warn!(error = %e, "lease renewal failed"),
        }
    }
}
