//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to
//! prevent log leaks.

pub mod secrets;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::monitor::BacklogThresholds;
use crate::store::QueueSettings;
use crate::worker::WorkerConfig;
use secrets::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker: WorkerConfig,
    pub queue: QueueSettings,
    pub backlog: BacklogThresholds,
    /// How often the monitor publishes a backlog event.
    pub backlog_log_interval: Duration,
    /// TOML table mapping job types to handler commands.
    pub handlers_file: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let job_timeout_ms: Option<u64> = optional_parsed("JOB_WORKER_JOB_TIMEOUT_MS")?;

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(parsed_var("JOB_WORKER_POLL_INTERVAL_MS", 2_000)?),
            batch_size: parsed_var("JOB_WORKER_BATCH_SIZE", 5)?,
            job_timeout: job_timeout_ms.map(Duration::from_millis),
        };
        if worker.batch_size == 0 {
            return Err(Error::Config(
                "JOB_WORKER_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if worker.poll_interval.is_zero() {
            return Err(Error::Config(
                "JOB_WORKER_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }

        let queue = QueueSettings {
            retry_base_delay: Duration::from_millis(parsed_var("JOB_RETRY_BASE_DELAY_MS", 5_000)?),
            lease_duration: Duration::from_millis(parsed_var("JOB_LEASE_MS", 300_000)?),
            default_max_attempts: parsed_var("JOB_DEFAULT_MAX_ATTEMPTS", 3)?,
        };
        if queue.default_max_attempts == 0 {
            return Err(Error::Config(
                "JOB_DEFAULT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if queue.lease_duration.is_zero() {
            return Err(Error::Config("JOB_LEASE_MS must be positive".to_string()));
        }

        let backlog = BacklogThresholds {
            warn: parsed_var("JOB_BACKLOG_WARN", 100)?,
            critical: parsed_var("JOB_BACKLOG_CRITICAL", 500)?,
            stale_after: Duration::from_millis(parsed_var("JOB_BACKLOG_STALE_AFTER_MS", 900_000)?),
        };
        backlog.validate()?;

        let backlog_log_interval =
            Duration::from_millis(parsed_var("JOB_BACKLOG_LOG_INTERVAL_MS", 60_000)?);
        if backlog_log_interval.is_zero() {
            return Err(Error::Config(
                "JOB_BACKLOG_LOG_INTERVAL_MS must be positive".to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker,
            queue,
            backlog,
            backlog_log_interval,
            handlers_file: std::env::var("JOB_HANDLERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("handlers.toml")),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Parse an optional variable, falling back to `default` when unset.
fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    Ok(optional_parsed(name)?.unwrap_or(default))
}

fn optional_parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}
