//! The job store contract.
//!
//! The store is the only shared mutable resource and the only coordination
//! point between producers and workers. Every mutation goes through the
//! narrow [`JobStore`] trait; claims must be a single atomic conditional
//! update so two workers can never hold the same job.

pub mod memory;

pub use memory::MemoryJobStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{BacklogCounts, Job, JobError, JobId, JobStatus, NewJob};

/// Message stored on jobs returned to the queue by lease reclamation.
pub const LEASE_EXPIRED_MESSAGE: &str = "worker lease expired";

/// Largest `max_attempts` a store accepts. Attempts are stored as a
/// Postgres `INTEGER`.
pub const MAX_ATTEMPTS_CEILING: u32 = i32::MAX as u32;

/// Queue-wide policy shared by every store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Linear backoff base: the k-th failure waits `retry_base_delay * k`.
    pub retry_base_delay: Duration,
    /// How long a claim stays valid without renewal.
    pub lease_duration: Duration,
    /// Applied when a producer does not set `max_attempts`.
    pub default_max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_millis(5_000),
            lease_duration: Duration::from_millis(300_000),
            default_max_attempts: 3,
        }
    }
}

/// Delay before a job that has failed `attempts` times becomes eligible again.
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(attempts)
}

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Retry and lease policy this store applies.
    fn settings(&self) -> &QueueSettings;

    /// Validate and insert a new job in `queued` status.
    async fn enqueue(&self, new: NewJob) -> Result<Job>;

    /// Atomically move up to `limit` due `queued` jobs to `running`.
    ///
    /// Oldest `next_run_at` first, then oldest `created_at`. Never blocks;
    /// returns an empty batch when nothing is due.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>>;

    /// Push the lease of a `running` job forward. Returns `false` if the job
    /// is no longer running under claim `attempt`.
    async fn renew_lease(&self, id: JobId, attempt: u32) -> Result<bool>;

    /// `running -> succeeded`.
    ///
    /// Finalize operations take the attempt number the caller claimed and
    /// only act while the job is still `running` under that attempt. Any
    /// other state is returned unchanged, so a late or repeated call never
    /// overwrites an outcome.
    async fn mark_succeeded(&self, id: JobId, attempt: u32, result: serde_json::Value) -> Result<Job>;

    /// `running -> queued` with backoff while attempts remain, otherwise
    /// `running -> failed`.
    async fn mark_failed_or_retry(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job>;

    /// `running -> failed` regardless of remaining attempts.
    async fn mark_failed(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job>;

    /// Requeue (or fail, if out of attempts) every `running` job whose lease
    /// has expired. Returns the affected jobs after the transition.
    async fn reclaim_expired(&self) -> Result<Vec<Job>>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// Counts per status plus the number of unfinished (`queued` or
    /// `running`) jobs created more than `stale_after` ago.
    async fn backlog_counts(&self, stale_after: Duration) -> Result<BacklogCounts>;
}

/// Check producer input and build the job document.
pub(crate) fn prepare_job(new: NewJob, settings: &QueueSettings, now: DateTime<Utc>) -> Result<Job> {
    if !new.payload.is_object() {
        return Err(Error::Validation(format!(
            "payload for {} must be a JSON object",
            new.job_type
        )));
    }
    if new.user_id.trim().is_empty() {
        return Err(Error::Validation("user id must not be empty".to_string()));
    }
    let max_attempts = new.max_attempts.unwrap_or(settings.default_max_attempts);
    if max_attempts == 0 {
        return Err(Error::Validation(
            "max_attempts must be a positive integer".to_string(),
        ));
    }
    if max_attempts > MAX_ATTEMPTS_CEILING {
        return Err(Error::Validation(format!(
            "max_attempts must be at most {MAX_ATTEMPTS_CEILING}, got {max_attempts}"
        )));
    }
    let correlation_id = match new.correlation_id {
        Some(id) if id.trim().is_empty() => {
            return Err(Error::Validation(
                "correlation id must not be blank".to_string(),
            ));
        }
        Some(id) => id,
        None => uuid::Uuid::new_v4().to_string(),
    };

    Ok(Job {
        id: JobId::new(),
        job_type: new.job_type,
        payload: new.payload,
        user_id: new.user_id,
        status: JobStatus::Queued,
        attempts: 0,
        max_attempts,
        next_run_at: now,
        lease_expires_at: None,
        result: None,
        error: None,
        correlation_id,
        created_at: now,
        updated_at: now,
    })
}

/// `at + d`, saturating at the far end of the calendar.
pub(crate) fn advance(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, saturating at the near end of the calendar.
pub(crate) fn rewind(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
