//! Integration tests for the worker loop against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobq::error::{Error, Result};
use jobq::model::*;
use jobq::poller::{PollOptions, wait_for_job};
use jobq::processor::{HandlerContext, HandlerError, HandlerRegistry, Processor, handler_fn};
use jobq::store::{JobStore, MemoryJobStore, QueueSettings};
use jobq::worker::{CycleReport, Worker, WorkerConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn fast_store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new(QueueSettings {
        retry_base_delay: Duration::ZERO,
        lease_duration: Duration::from_secs(30),
        default_max_attempts: 3,
    }))
}

fn worker_with(store: &Arc<MemoryJobStore>, processor: Processor, config: WorkerConfig) -> Worker {
    let store: Arc<dyn JobStore> = store.clone();
    Worker::new(store, Arc::new(processor), config)
}

fn config(poll_ms: u64, batch_size: usize) -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(poll_ms),
        batch_size,
        job_timeout: None,
    }
}

fn only(job_type: JobType, handler: impl jobq::processor::JobHandler + 'static) -> Processor {
    HandlerRegistry::new().register(job_type, handler).build_partial()
}

fn echo() -> Processor {
    only(
        JobType::MeetingRescan,
        handler_fn(|ctx: HandlerContext| async move {
            Ok::<_, HandlerError>(json!({"echo": ctx.payload, "attempt": ctx.attempt}))
        }),
    )
}

fn rescan(user: &str) -> NewJob {
    NewJob::new(JobType::MeetingRescan, user).payload(json!({"meeting_id": "m-1"}))
}

/// In-memory store whose claims and finalizes can be made to fail the way a
/// dropped database connection would.
struct FlakyStore {
    inner: Arc<MemoryJobStore>,
    failing_claims: AtomicUsize,
    failing_finalize: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryJobStore>) -> Self {
        Self {
            inner,
            failing_claims: AtomicUsize::new(0),
            failing_finalize: AtomicBool::new(false),
        }
    }

    fn finalize_result(&self) -> Result<()> {
        if self.failing_finalize.load(Ordering::SeqCst) {
            return Err(Error::Connectivity(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    fn settings(&self) -> &QueueSettings {
        self.inner.settings()
    }
    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        self.inner.enqueue(new).await
    }
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>> {
        let failing = self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Connectivity(sqlx::Error::PoolTimedOut));
        }
        self.inner.claim_batch(limit).await
    }
    async fn renew_lease(&self, id: JobId, attempt: u32) -> Result<bool> {
        self.inner.renew_lease(id, attempt).await
    }
    async fn mark_succeeded(&self, id: JobId, attempt: u32, result: serde_json::Value) -> Result<Job> {
        self.finalize_result()?;
        self.inner.mark_succeeded(id, attempt, result).await
    }
    async fn mark_failed_or_retry(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job> {
        self.finalize_result()?;
        self.inner.mark_failed_or_retry(id, attempt, error).await
    }
    async fn mark_failed(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job> {
        self.finalize_result()?;
        self.inner.mark_failed(id, attempt, error).await
    }
    async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        self.inner.reclaim_expired().await
    }
    async fn get(&self, id: JobId) -> Result<Job> {
        self.inner.get(id).await
    }
    async fn backlog_counts(&self, stale_after: Duration) -> Result<BacklogCounts> {
        self.inner.backlog_counts(stale_after).await
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_records_result() {
    let store = fast_store();
    let worker = worker_with(&store, echo(), config(10, 5));
    let job = store.enqueue(rescan("user-1")).await.unwrap();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(
        report,
        CycleReport {
            claimed: 1,
            succeeded: 1,
            ..Default::default()
        }
    );

    let done = store.get(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 1);
    assert_eq!(
        done.result,
        Some(json!({"echo": {"meeting_id": "m-1"}, "attempt": 1}))
    );
    assert!(done.lease_expires_at.is_none());
}

#[tokio::test]
async fn always_failing_job_fails_after_max_attempts() {
    let store = fast_store();
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|_ctx: HandlerContext| async {
            Err::<serde_json::Value, _>(HandlerError::retryable("fathom unreachable"))
        }),
    );
    let worker = worker_with(&store, processor, config(10, 5));
    let job = store.enqueue(rescan("user-1").max_attempts(3)).await.unwrap();

    assert_eq!(worker.run_cycle().await.unwrap().retried, 1);
    assert_eq!(worker.run_cycle().await.unwrap().retried, 1);
    assert_eq!(worker.run_cycle().await.unwrap().failed, 1);
    assert_eq!(worker.run_cycle().await.unwrap().claimed, 0);

    let failed = store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.error.unwrap().message, "fathom unreachable");
}

#[tokio::test]
async fn flaky_job_succeeds_on_retry() {
    let store = fast_store();
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|ctx: HandlerContext| async move {
            if ctx.attempt < 2 {
                return Err(HandlerError::retryable("transient"));
            }
            Ok(json!({"attempt": ctx.attempt}))
        }),
    );
    let worker = worker_with(&store, processor, config(10, 5));
    let job = store.enqueue(rescan("user-1")).await.unwrap();

    assert_eq!(worker.run_cycle().await.unwrap().retried, 1);
    assert_eq!(worker.run_cycle().await.unwrap().succeeded, 1);

    let done = store.get(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result, Some(json!({"attempt": 2})));
}

#[tokio::test]
async fn unsupported_type_fails_immediately() {
    let store = fast_store();
    let worker = worker_with(&store, echo(), config(10, 5));
    let job = store
        .enqueue(NewJob::new(JobType::SlackUsersSync, "user-1").max_attempts(3))
        .await
        .unwrap();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(
        failed
            .error
            .unwrap()
            .message
            .contains("unsupported job type: slack-users-sync")
    );
}

#[tokio::test]
async fn permanent_error_skips_retries() {
    let store = fast_store();
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|_ctx: HandlerContext| async {
            Err::<serde_json::Value, _>(
                HandlerError::permanent("meeting does not exist").with_cause("404"),
            )
        }),
    );
    let worker = worker_with(&store, processor, config(10, 5));
    let job = store.enqueue(rescan("user-1").max_attempts(5)).await.unwrap();

    assert_eq!(worker.run_cycle().await.unwrap().failed, 1);
    let failed = store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    let error = failed.error.unwrap();
    assert_eq!(error.message, "meeting does not exist");
    assert_eq!(error.cause.as_deref(), Some("404"));
}

#[tokio::test]
async fn slow_job_times_out_as_a_failed_attempt() {
    let store = fast_store();
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|_ctx: HandlerContext| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, HandlerError>(json!({}))
        }),
    );
    let mut cfg = config(10, 5);
    cfg.job_timeout = Some(Duration::from_millis(50));
    let worker = worker_with(&store, processor, cfg);
    let job = store.enqueue(rescan("user-1").max_attempts(1)).await.unwrap();

    assert_eq!(worker.run_cycle().await.unwrap().failed, 1);
    let failed = store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().message.contains("timed out"));
}

#[tokio::test]
async fn panicking_handler_is_a_retryable_failure() {
    let store = fast_store();
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|ctx: HandlerContext| async move {
            if ctx.attempt == 1 {
                panic!("handler blew up");
            }
            Ok::<_, HandlerError>(json!({"recovered": true}))
        }),
    );
    let worker = worker_with(&store, processor, config(10, 5));
    let job = store.enqueue(rescan("user-1")).await.unwrap();

    assert_eq!(worker.run_cycle().await.unwrap().retried, 1);
    assert_eq!(
        store.get(job.id).await.unwrap().error.unwrap().message,
        "handler panicked"
    );
    assert_eq!(worker.run_cycle().await.unwrap().succeeded, 1);
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_size_bounds_each_cycle() {
    let store = fast_store();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let processor = only(JobType::MeetingRescan, {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        handler_fn(move |_ctx: HandlerContext| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(json!({}))
            }
        })
    });
    let worker = worker_with(&store, processor, config(10, 5));
    for i in 0..12 {
        store.enqueue(rescan(&format!("user-{i}"))).await.unwrap();
    }

    let claimed: Vec<usize> = [
        worker.run_cycle().await.unwrap().claimed,
        worker.run_cycle().await.unwrap().claimed,
        worker.run_cycle().await.unwrap().claimed,
        worker.run_cycle().await.unwrap().claimed,
    ]
    .into();
    assert_eq!(claimed, vec![5, 5, 2, 0]);
    assert!(peak.load(Ordering::SeqCst) <= 5);
    assert!(
        store
            .all()
            .await
            .iter()
            .all(|j| j.status == JobStatus::Succeeded)
    );
}

#[tokio::test]
async fn run_drains_backlog_without_waiting_for_poll_interval() {
    let store = fast_store();
    let worker = Arc::new(worker_with(&store, echo(), config(60_000, 5)));
    for i in 0..12 {
        store.enqueue(rescan(&format!("user-{i}"))).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    wait_until(|| {
        let store = Arc::clone(&store);
        async move {
            store
                .all()
                .await
                .iter()
                .all(|j| j.status == JobStatus::Succeeded)
        }
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Wake-up and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn kick_wakes_an_idle_worker() {
    let store = fast_store();
    let worker = Arc::new(worker_with(&store, echo(), config(60_000, 5)));
    let kicker = worker.kicker();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    // Let the first (empty) cycle finish so the worker is asleep.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = store.enqueue(rescan("user-1")).await.unwrap();
    kicker.kick();

    let done = wait_for_job(
        &*store,
        job.id,
        PollOptions {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        },
    )
    .await
    .unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn cancelled_worker_claims_nothing() {
    let store = fast_store();
    let worker = worker_with(&store, echo(), config(10, 5));
    let job = store.enqueue(rescan("user-1")).await.unwrap();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), worker.run(shutdown))
        .await
        .expect("cancelled worker must return promptly");

    let untouched = store.get(job.id).await.unwrap();
    assert_eq!(untouched.status, JobStatus::Queued);
    assert_eq!(untouched.attempts, 0);
}

#[tokio::test]
async fn shutdown_lets_in_flight_jobs_finish() {
    let store = fast_store();
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|_ctx: HandlerContext| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, HandlerError>(json!({"slow": true}))
        }),
    );
    let worker = Arc::new(worker_with(&store, processor, config(10, 5)));
    let a = store.enqueue(rescan("a")).await.unwrap();
    let b = store.enqueue(rescan("b")).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    let first = a.id;
    wait_until(|| {
        let store = Arc::clone(&store);
        async move { store.get(first).await.unwrap().status == JobStatus::Running }
    })
    .await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();

    for id in [a.id, b.id] {
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    assert!(
        store
            .all()
            .await
            .iter()
            .all(|j| j.status != JobStatus::Running)
    );
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_claim_fails_the_cycle() {
    let store = Arc::new(FlakyStore::new(fast_store()));
    store.failing_claims.store(1, Ordering::SeqCst);
    let worker = Worker::new(store.clone(), Arc::new(echo()), config(10, 5));

    let err = worker.run_cycle().await.unwrap_err();
    assert!(matches!(err, Error::Connectivity(_)), "got {err:?}");
}

#[tokio::test]
async fn worker_keeps_running_through_store_outage() {
    let inner = fast_store();
    let store = Arc::new(FlakyStore::new(Arc::clone(&inner)));
    store.failing_claims.store(3, Ordering::SeqCst);
    let job = inner.enqueue(rescan("user-1")).await.unwrap();
    let worker = Worker::new(store.clone(), Arc::new(echo()), config(20, 5));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    wait_until(|| {
        let inner = Arc::clone(&inner);
        async move { inner.get(job.id).await.unwrap().status == JobStatus::Succeeded }
    })
    .await;
    assert_eq!(store.failing_claims.load(Ordering::SeqCst), 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn unrecorded_outcome_leaves_job_leased_until_reclaimed() {
    let inner = fast_store();
    let store = Arc::new(FlakyStore::new(Arc::clone(&inner)));
    store.failing_finalize.store(true, Ordering::SeqCst);
    let job = inner.enqueue(rescan("user-1")).await.unwrap();
    let worker = Worker::new(store.clone(), Arc::new(echo()), config(10, 5));

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(
        report,
        CycleReport {
            claimed: 1,
            unrecorded: 1,
            ..CycleReport::default()
        }
    );
    let stuck = inner.get(job.id).await.unwrap();
    assert_eq!(stuck.status, JobStatus::Running);
    assert!(stuck.lease_expires_at.is_some());
    assert!(stuck.result.is_none());

    // The store recovers and the lease lapses; the job runs again.
    store.failing_finalize.store(false, Ordering::SeqCst);
    inner
        .update_for_test(job.id, |j| {
            j.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1))
        })
        .await
        .unwrap();
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.succeeded, 1);

    let done = inner.get(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 2);
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphaned_job_is_reclaimed_and_rerun() {
    let store = fast_store();
    let worker = worker_with(&store, echo(), config(10, 5));
    let job = store.enqueue(rescan("user-1")).await.unwrap();

    // A worker that crashed after claiming.
    store.claim_batch(1).await.unwrap();
    store
        .update_for_test(job.id, |j| {
            j.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1))
        })
        .await
        .unwrap();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.claimed, 1);
    assert_eq!(report.succeeded, 1);

    let done = store.get(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 2);
}

#[tokio::test]
async fn heartbeat_keeps_long_jobs_leased() {
    let store = Arc::new(MemoryJobStore::new(QueueSettings {
        retry_base_delay: Duration::ZERO,
        lease_duration: Duration::from_millis(300),
        default_max_attempts: 3,
    }));
    let processor = only(
        JobType::MeetingRescan,
        handler_fn(|_ctx: HandlerContext| async {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            Ok::<_, HandlerError>(json!({}))
        }),
    );
    let worker = worker_with(&store, processor, config(10, 5));
    let job = store.enqueue(rescan("user-1")).await.unwrap();

    // Another process sweeping for orphans while the job runs.
    let sweeper = tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            let mut reclaimed = 0;
            for _ in 0..16 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                reclaimed += store.reclaim_expired().await.unwrap().len();
            }
            reclaimed
        }
    });

    assert_eq!(worker.run_cycle().await.unwrap().succeeded, 1);
    assert_eq!(sweeper.await.unwrap(), 0);

    let done = store.get(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 1);
}
