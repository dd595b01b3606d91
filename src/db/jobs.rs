//! Postgres job store.
//!
//! Every transition is one conditional `UPDATE … RETURNING`. Claims pick
//! their rows with `FOR UPDATE SKIP LOCKED` inside the same statement, so
//! concurrent workers never see the same job. Timestamps come from the
//! database clock (`now()`), which all processes share.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use uuid::Uuid;

use super::{Db, JOB_READY_CHANNEL};
use crate::error::{Error, Result};
use crate::model::{BacklogCounts, Job, JobError, JobId, NewJob};
use crate::store::{JobStore, LEASE_EXPIRED_MESSAGE, QueueSettings, prepare_job};
use crate::telemetry::metrics;

const JOB_COLUMNS: &str = "id, job_type, payload, user_id, status, attempts, max_attempts, next_run_at, \
     lease_expires_at, result, error, correlation_id, created_at, updated_at";

fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

/// Attempt counters are `INTEGER` columns.
fn attempt_param(n: u32) -> Result<i32> {
    i32::try_from(n).map_err(|_| Error::Validation(format!("attempt count {n} out of range")))
}

fn error_json(error: &JobError) -> Result<serde_json::Value> {
    serde_json::to_value(error).map_err(|e| Error::Other(format!("serialize job error: {e}")))
}

impl Db {
    /// `running -> queued` with linear backoff, or `running -> failed` when
    /// the ceiling is reached. `None` unless the job is running under `attempt`.
    async fn fail_or_requeue(&self, id: JobId, attempt: u32, error: &JobError) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs SET
                status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                next_run_at = CASE WHEN attempts < max_attempts
                    THEN now() + ($2::float8 * attempts) * INTERVAL '1 microsecond'
                    ELSE next_run_at END,
                error = $3, lease_expires_at = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running' AND attempts = $4
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(micros(self.settings.retry_base_delay) as f64)
            .bind(error_json(error)?)
            .bind(attempt_param(attempt)?)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::try_into_job).transpose()
    }
}

#[async_trait]
impl JobStore for Db {
    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let job = prepare_job(new, &self.settings, chrono::Utc::now())?;
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO jobs (id, job_type, payload, user_id, status, attempts, max_attempts, correlation_id)
             VALUES ($1, $2, $3, $4, 'queued', 0, $5, $6)
             RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(job.id.0)
            .bind(job.job_type.as_str())
            .bind(&job.payload)
            .bind(&job.user_id)
            .bind(attempt_param(job.max_attempts)?)
            .bind(&job.correlation_id)
            .fetch_one(&mut *tx)
            .await?;

        // NOTIFY only fires on commit.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOB_READY_CHANNEL)
            .bind(job.job_type.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::jobs_enqueued().add(1, &[KeyValue::new("job_type", job.job_type.as_str())]);
        row.try_into_job()
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = now(),
                lease_expires_at = now() + $2::float8 * INTERVAL '1 microsecond'
             WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'queued' AND next_run_at <= now() AND attempts < max_attempts
                ORDER BY next_run_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(micros(self.settings.lease_duration) as f64)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = rows
            .into_iter()
            .map(JobRow::try_into_job)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING has no defined order.
        jobs.sort_by_key(|j| (j.next_run_at, j.created_at));
        Ok(jobs)
    }

    async fn renew_lease(&self, id: JobId, attempt: u32) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE jobs SET lease_expires_at = now() + $2::float8 * INTERVAL '1 microsecond'
             WHERE id = $1 AND status = 'running' AND attempts = $3",
        )
        .bind(id.0)
        .bind(micros(self.settings.lease_duration) as f64)
        .bind(attempt_param(attempt)?)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn mark_succeeded(&self, id: JobId, attempt: u32, result: serde_json::Value) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs SET status = 'succeeded', result = $2, lease_expires_at = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running' AND attempts = $3
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(&result)
            .bind(attempt_param(attempt)?)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row.try_into_job(),
            None => self.get(id).await,
        }
    }

    async fn mark_failed_or_retry(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job> {
        match self.fail_or_requeue(id, attempt, &error).await? {
            Some(job) => Ok(job),
            None => self.get(id).await,
        }
    }

    async fn mark_failed(&self, id: JobId, attempt: u32, error: JobError) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs SET status = 'failed', error = $2, lease_expires_at = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running' AND attempts = $3
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .bind(error_json(&error)?)
            .bind(attempt_param(attempt)?)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row.try_into_job(),
            None => self.get(id).await,
        }
    }

    async fn reclaim_expired(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "UPDATE jobs SET
                status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                next_run_at = CASE WHEN attempts < max_attempts
                    THEN now() + ($1::float8 * attempts) * INTERVAL '1 microsecond'
                    ELSE next_run_at END,
                error = $2, lease_expires_at = NULL, updated_at = now()
             WHERE status = 'running' AND lease_expires_at <= now()
             RETURNING {JOB_COLUMNS}"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(micros(self.settings.retry_base_delay) as f64)
            .bind(error_json(&JobError::new(LEASE_EXPIRED_MESSAGE))?)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    async fn backlog_counts(&self, stale_after: Duration) -> Result<BacklogCounts> {
        let row: (i64, i64, i64, i64, i64, Option<i64>) = sqlx::query_as(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'queued'),
                COUNT(*) FILTER (WHERE status = 'running'),
                COUNT(*) FILTER (WHERE status = 'succeeded'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status IN ('queued', 'running')
                    AND created_at < now() - $1::float8 * INTERVAL '1 microsecond'),
                (EXTRACT(EPOCH FROM now() - MIN(created_at) FILTER (WHERE status = 'queued')) * 1000)::bigint
             FROM jobs",
        )
        .bind(micros(stale_after) as f64)
        .fetch_one(&self.pool)
        .await?;

        let (queued, running, succeeded, failed, stale, oldest_ms) = row;
        Ok(BacklogCounts {
            queued: queued as u64,
            running: running as u64,
            succeeded: succeeded as u64,
            failed: failed as u64,
            stale: stale as u64,
            oldest_queued_age_ms: oldest_ms.map(|ms| ms.max(0) as u64),
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    user_id: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: chrono::DateTime<chrono::Utc>,
    lease_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    correlation_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        let error = self
            .error
            .map(serde_json::from_value::<JobError>)
            .transpose()
            .map_err(|e| Error::Other(format!("bad error column on job {}: {e}", self.id)))?;

        Ok(Job {
            id: JobId(self.id),
            job_type: self
                .job_type
                .parse()
                .map_err(|_| Error::UnsupportedJobType(self.job_type.clone()))?,
            payload: self.payload,
            user_id: self.user_id,
            status: self.status.parse()?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| Error::Other(format!("negative attempts on job {}", self.id)))?,
            max_attempts: u32::try_from(self.max_attempts)
                .map_err(|_| Error::Other(format!("negative max_attempts on job {}", self.id)))?,
            next_run_at: self.next_run_at,
            lease_expires_at: self.lease_expires_at,
            result: self.result,
            error,
            correlation_id: self.correlation_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
