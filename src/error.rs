//! Error types for jobq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed enqueue input. Rejected before anything is stored.
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// No handler is registered for the job's type.
    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),

    /// The job store could not be reached or rejected the query.
    #[error("job store unavailable: {0}")]
    Connectivity(#[from] sqlx::Error),

    #[error("job {id} did not finish within {waited_ms}ms")]
    Timeout { id: String, waited_ms: u64 },

    #[error("job {id} failed: {message}")]
    JobFailed { id: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
