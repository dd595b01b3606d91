//! Wait for a job from request-handling code.
//!
//! Polls the store at a fixed interval until the job is terminal or the
//! caller's budget runs out. Timing out does not touch the job; it keeps
//! running server-side.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus, NewJob};
use crate::store::JobStore;

/// Shortest pause between two reads of the job.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Block until `id` is `succeeded` (returns the job), `failed`
/// ([`Error::JobFailed`] with the stored message), or `options.timeout`
/// elapses ([`Error::Timeout`]). An interval below [`MIN_POLL_INTERVAL`]
/// is raised to it.
pub async fn wait_for_job(store: &dyn JobStore, id: JobId, options: PollOptions) -> Result<Job> {
    let started = Instant::now();
    let deadline = started + options.timeout;
    let interval = options.interval.max(MIN_POLL_INTERVAL);

    loop {
        let job = store.get(id).await?;
        match job.status {
            JobStatus::Succeeded => return Ok(job),
            JobStatus::Failed => {
                let message = job
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "job failed".to_string());
                return Err(Error::JobFailed {
                    id: id.to_string(),
                    message,
                });
            }
            JobStatus::Queued | JobStatus::Running => {
                debug!(
                    "job.id" = %id,
                    status = %job.status,
                    attempts = job.attempts,
                    "job not finished"
                );
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout {
                id: id.to_string(),
                waited_ms: (now - started).as_millis() as u64,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Enqueue and wait in one call.
pub async fn enqueue_and_wait(store: &dyn JobStore, new: NewJob, options: PollOptions) -> Result<Job> {
    let job = store.enqueue(new).await?;
    wait_for_job(store, job.id, options).await
}
