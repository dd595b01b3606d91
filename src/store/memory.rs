//! In-process job store.
//!
//! Holds every job behind one async mutex, so each operation is trivially
//! atomic. Suitable for tests and single-process deployments; multiple
//! processes must share the Postgres store instead.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    JobStore, LEASE_EXPIRED_MESSAGE, QueueSettings, advance, backoff_delay, prepare_job, rewind,
};
use crate::error::{Error, Result};
use crate::model::{BacklogCounts, Job, JobError, JobId, JobStatus, NewJob};
use crate::telemetry::metrics;

#[derive(Default)]
struct Inner {
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
}

impl Inner {
    fn get_mut(&mut self, id: JobId) -> Result<&mut Job> {
        let pos = *self
            .index
            .get(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(&mut self.jobs[pos])
    }
}

/// Job store backed by process memory.
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    settings: QueueSettings,
}

impl MemoryJobStore {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings,
        }
    }

    /// Snapshot of every stored job, in insertion order.
    pub async fn all(&self) -> Vec<Job> {
        self.inner.lock().await.jobs.clone()
    }

    /// Rewrite a stored job in place. Lets tests age jobs or expire leases
    /// without waiting on the wall clock.
    pub async fn update_for_test<F>(&self, id: JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut inner = self.inner.lock().await;
        let job = inner.get_mut(id)?;
        f(job);
        Ok(job.clone())
    }

    fn fail_or_requeue(&self, job: &mut Job, error: JobError, now: DateTime<Utc>) {
        job.updated_at = now;
        job.lease_expires_at = None;
        if job.has_attempts_left() {
            job.status = JobStatus::Queued;
            let delay = backoff_delay(self.settings.retry_base_delay, job.attempts);
            job.next_run_at = advance(now, delay);
        } else {
            job.status = JobStatus::Failed;
        }
        job.error = Some(error);
    }
}

/// Is `job` still running under the claim that produced `attempt`?
fn is_claimed_by(job: &Job, attempt: u32) -> bool {
    job.status == JobStatus::Running && job.attempts == attempt
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let job = prepare_job(new, &self.settings, Utc::now())?;
        let mut inner = self.inner.lock().await;
        let pos = inner.jobs.len();
        inner.index.insert(job.id, pos);
        inner.jobs.push(job.clone());
        metrics::jobs_enqueued().add(1, &[KeyValue::new("job_type", job.job_type.as_str())]);
        Ok(job)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let lease_until = advance(now, self.settings.lease_duration);
        let mut inner = self.inner.lock().await;

        let mut due: Vec<usize> = inner
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                j.status == JobStatus::Queued && j.next_run_at <= now && j.has_attempts_left()
            })
            .map(|(pos, _)| pos)
            .collect();
        // Stable sort keeps insertion order as the last tie-break.
        due.sort_by_key(|&pos| (inner.jobs[pos].next_run_at, inner.jobs[pos].created_at));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for pos in due {
            let job = &mut inner.jobs[pos];
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.updated_at = now;
            job.lease_expires_at = Some(lease_until);
            claimed.push(job.clone());
        }
        debug!(claimed = claimed.len(), limit, "claimed batch");
        Ok(claimed)
    }

    async fn renew_lease(&self, id: JobId, attempt: u32) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.get_mut(id)?;
        if !is_claimed_by(job, attempt) {
            return Ok(false);
        }
        job.lease_expires_at = Some(advance(now, self.settings.lease_duration));
        Ok(true)
    }

    async fn mark_succeeded(&self, id: JobId, attempt: u32, result: serde_json::Value) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.get_mut(id)?;
        if is_claimed_by(job, attempt) {
            job.status = JobStatus::Succeeded;
            job.result = Some(result);
            job.lease_expires_at = None;
            job.updated_at = now;
        }
        Ok(job.clone())
    }

    async fn mark_failed_or_retry(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.get_mut(id)?;
        if is_claimed_by(job, attempt) {
            self.fail_or_requeue(job, error, now);
        }
        Ok(job.clone())
    }

    async fn mark_failed(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let job = inner.get_mut(id)?;
        if is_claimed_by(job, attempt) {
            job.status = JobStatus::Failed;
            job.error = Some(error);
            job.lease_expires_at = None;
            job.updated_at = now;
        }
        Ok(job.clone())
    }

    async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut reclaimed = Vec::new();
        for job in inner.jobs.iter_mut() {
            let expired = job.status == JobStatus::Running
                && job.lease_expires_at.is_some_and(|until| until <= now);
            if expired {
                self.fail_or_requeue(job, JobError::new(LEASE_EXPIRED_MESSAGE), now);
                reclaimed.push(job.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let mut inner = self.inner.lock().await;
        inner.get_mut(id).map(|job| job.clone())
    }

    async fn backlog_counts(&self, stale_after: Duration) -> Result<BacklogCounts> {
        let now = Utc::now();
        let stale_before = rewind(now, stale_after);
        let inner = self.inner.lock().await;

        let mut counts = BacklogCounts::default();
        let mut oldest_queued: Option<DateTime<Utc>> = None;
        for job in &inner.jobs {
            match job.status {
                JobStatus::Queued => {
                    counts.queued += 1;
                    oldest_queued = Some(match oldest_queued {
                        Some(t) => t.min(job.created_at),
                        None => job.created_at,
                    });
                }
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
            if !job.is_terminal() && job.created_at < stale_before {
                counts.stale += 1;
            }
        }
        counts.oldest_queued_age_ms =
            oldest_queued.map(|t| (now - t).num_milliseconds().max(0) as u64);
        Ok(counts)
    }
}
