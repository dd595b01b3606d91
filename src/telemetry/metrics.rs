//! Metric instrument factories for jobq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobq"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Returns the shared meter for jobq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobq")
}

/// Counter: jobs accepted by the store.
/// Labels: `job_type`.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: jobs moved to `running` by a claim.
/// Labels: `job_type`.
pub fn jobs_claimed() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.claimed")
        .with_description("Number of jobs claimed by workers")
        .build()
}

/// Counter: finalized attempts.
/// Labels: `job_type`, `outcome` ("succeeded" | "retried" | "failed").
pub fn job_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("jobq.jobs.outcomes")
        .with_description("Job attempt outcomes")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `job_type`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobq.job.duration_ms")
        .with_description("Job handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: worker loop iterations.
/// Labels: `result` ("jobs" | "empty" | "error").
pub fn worker_cycles() -> Counter<u64> {
    meter()
        .u64_counter("jobq.worker.cycles")
        .with_description("Number of worker claim cycles")
        .build()
}

/// Counter: store operations that failed.
/// Labels: `operation`.
pub fn store_errors() -> Counter<u64> {
    meter()
        .u64_counter("jobq.store.errors")
        .with_description("Job store operation failures")
        .build()
}

/// Counter: running jobs recovered after their lease expired.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("jobq.leases.reclaimed")
        .with_description("Jobs reclaimed after worker lease expiry")
        .build()
}

/// Gauge: jobs by backlog dimension.
/// Labels: `kind` ("queued" | "running" | "stale").
pub fn backlog_jobs() -> Gauge<u64> {
    meter()
        .u64_gauge("jobq.backlog.jobs")
        .with_description("Current job backlog")
        .build()
}

/// Gauge: backlog level (0 = ok, 1 = warn, 2 = critical).
pub fn backlog_level() -> Gauge<u64> {
    meter()
        .u64_gauge("jobq.backlog.level")
        .with_description("Backlog health level")
        .build()
}
