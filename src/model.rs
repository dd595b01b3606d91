//! Core data model.
//!
//! A job is one unit of durable background work. It has a closed type tag
//! that selects its handler, an opaque payload, an owning user, and a
//! lifecycle status driven exclusively by the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Selects the handler. Closed set, see [`JobType`].
    pub job_type: JobType,

    /// Type-specific input. Opaque to the store and worker.
    pub payload: serde_json::Value,

    /// Owning principal. Carried for audit and observability only.
    pub user_id: String,

    pub status: JobStatus,

    /// Execution attempts made so far. Incremented on claim.
    pub attempts: u32,

    /// Attempt ceiling. Always >= 1.
    pub max_attempts: u32,

    /// Earliest time the job may be claimed.
    pub next_run_at: DateTime<Utc>,

    /// Set while `running`. A lease that expires marks the job as orphaned.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Handler output, only set once `succeeded`.
    pub result: Option<serde_json::Value>,

    /// Most recent failure. Kept on the final `failed` status.
    pub error: Option<JobError>,

    pub correlation_id: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Is the job in a status that no longer changes?
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Can another attempt be made after a failure on the current one?
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| Error::Validation(format!("bad job id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Job type
// ---------------------------------------------------------------------------

/// The closed set of job kinds. Adding a variant requires registering a
/// handler for it, otherwise the worker refuses to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    MeetingRescan,
    FathomSync,
    SlackUsersSync,
    FathomWebhookIngest,
    DomainEventDispatch,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::MeetingRescan,
        JobType::FathomSync,
        JobType::SlackUsersSync,
        JobType::FathomWebhookIngest,
        JobType::DomainEventDispatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::MeetingRescan => "meeting-rescan",
            JobType::FathomSync => "fathom-sync",
            JobType::SlackUsersSync => "slack-users-sync",
            JobType::FathomWebhookIngest => "fathom-webhook-ingest",
            JobType::DomainEventDispatch => "domain-event-dispatch",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown job type: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// `queued -> running -> succeeded`, or `running -> queued` on a retryable
/// failure, or `running -> failed` once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown job status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Failure info
// ---------------------------------------------------------------------------

/// Structured failure recorded on the job. `message` is what users see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} ({cause})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Backlog
// ---------------------------------------------------------------------------

/// Aggregated counts read by the backlog monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogCounts {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Unfinished (`queued` or `running`) jobs whose age exceeds the stale
    /// threshold.
    pub stale: u64,
    /// Age in milliseconds of the oldest `queued` job, if any.
    pub oldest_queued_age_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The public API for producers.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: JobType,
    pub(crate) payload: serde_json::Value,
    pub(crate) user_id: String,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) correlation_id: Option<String>,
}

impl NewJob {
    pub fn new(job_type: JobType, user_id: impl Into<String>) -> Self {
        Self {
            job_type,
            payload: serde_json::json!({}),
            user_id: user_id.into(),
            max_attempts: None,
            correlation_id: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }
}
