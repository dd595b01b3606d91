//! Backlog health.
//!
//! Reads aggregate counts from the store and grades the queued backlog as
//! ok / warn / critical. Purely advisory: the monitor never writes jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::BacklogCounts;
use crate::store::JobStore;
use crate::telemetry::metrics;

/// Exit code for a `critical` health check.
pub const CRITICAL_EXIT_CODE: i32 = 2;

/// Shortest period `run` will tick at.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Backlog grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogLevel {
    Ok,
    Warn,
    Critical,
}

impl BacklogLevel {
    /// Process exit code for a one-shot health check. Only `critical` fails.
    pub fn exit_code(self) -> i32 {
        match self {
            BacklogLevel::Ok | BacklogLevel::Warn => 0,
            BacklogLevel::Critical => CRITICAL_EXIT_CODE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BacklogLevel::Ok => "ok",
            BacklogLevel::Warn => "warn",
            BacklogLevel::Critical => "critical",
        }
    }

    fn gauge_value(self) -> u64 {
        match self {
            BacklogLevel::Ok => 0,
            BacklogLevel::Warn => 1,
            BacklogLevel::Critical => 2,
        }
    }
}

impl std::fmt::Display for BacklogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds on the number of `queued` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogThresholds {
    pub warn: u64,
    pub critical: u64,
    /// Age past which an unfinished job counts as stale.
    pub stale_after: Duration,
}

impl Default for BacklogThresholds {
    fn default() -> Self {
        Self {
            warn: 100,
            critical: 500,
            stale_after: Duration::from_millis(900_000),
        }
    }
}

impl BacklogThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.warn > self.critical {
            return Err(Error::Config(format!(
                "backlog warn threshold ({}) exceeds critical threshold ({})",
                self.warn, self.critical
            )));
        }
        Ok(())
    }

    /// Grade a queued count. Each threshold is inclusive.
    pub fn level_for(&self, queued: u64) -> BacklogLevel {
        if queued >= self.critical {
            BacklogLevel::Critical
        } else if queued >= self.warn {
            BacklogLevel::Warn
        } else {
            BacklogLevel::Ok
        }
    }
}

/// One observation of the backlog.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogSnapshot {
    pub taken_at: DateTime<Utc>,
    pub counts: BacklogCounts,
    pub level: BacklogLevel,
}

impl BacklogSnapshot {
    pub fn exit_code(&self) -> i32 {
        self.level.exit_code()
    }
}

pub struct BacklogMonitor {
    store: Arc<dyn JobStore>,
    thresholds: BacklogThresholds,
}

impl BacklogMonitor {
    pub fn new(store: Arc<dyn JobStore>, thresholds: BacklogThresholds) -> Self {
        Self { store, thresholds }
    }

    /// Read counts and grade them.
    pub async fn snapshot(&self) -> Result<BacklogSnapshot> {
        let counts = self.store.backlog_counts(self.thresholds.stale_after).await?;
        Ok(BacklogSnapshot {
            taken_at: Utc::now(),
            level: self.thresholds.level_for(counts.queued),
            counts,
        })
    }

    /// Take a snapshot and publish it as a log event and gauges.
    pub async fn check(&self) -> Result<BacklogSnapshot> {
        let snapshot = self.snapshot().await?;
        publish(&snapshot, &self.thresholds);
        Ok(snapshot)
    }

    /// Publish a snapshot every `interval` until cancelled. Intervals below
    /// [`MIN_CHECK_INTERVAL`] are raised to it.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(MIN_CHECK_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!(error = %e, "backlog check failed");
                    }
                }
            }
        }
    }
}

fn publish(snapshot: &BacklogSnapshot, thresholds: &BacklogThresholds) {
    let c = &snapshot.counts;
    let gauge = metrics::backlog_jobs();
    gauge.record(c.queued, &[KeyValue::new("kind", "queued")]);
    gauge.record(c.running, &[KeyValue::new("kind", "running")]);
    gauge.record(c.stale, &[KeyValue::new("kind", "stale")]);
    metrics::backlog_level().record(snapshot.level.gauge_value(), &[]);

    match snapshot.level {
        BacklogLevel::Ok => info!(
            backlog_level = %snapshot.level,
            queued = c.queued,
            running = c.running,
            failed = c.failed,
            stale = c.stale,
            oldest_queued_age_ms = c.oldest_queued_age_ms,
            "job backlog"
        ),
        BacklogLevel::Warn | BacklogLevel::Critical => warn!(
            backlog_level = %snapshot.level,
            queued = c.queued,
            running = c.running,
            failed = c.failed,
            stale = c.stale,
            oldest_queued_age_ms = c.oldest_queued_age_ms,
            warn_threshold = thresholds.warn,
            critical_threshold = thresholds.critical,
            "job backlog above threshold"
        ),
    }
}
