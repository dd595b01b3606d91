//! Job execution span helpers.

use tracing::Span;

use crate::model::Job;

/// Start a span for one execution attempt of a job.
///
/// `job.outcome` is declared empty and filled in by [`record_outcome`].
pub fn start_job_span(job: &Job) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job.id,
        "job.type" = %job.job_type,
        "job.attempt" = job.attempts,
        "job.max_attempts" = job.max_attempts,
        correlation_id = %job.correlation_id,
        user_id = %job.user_id,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record how the attempt ended and emit a `status_transition` event.
pub fn record_outcome(span: &Span, from: &str, to: &str) {
    span.record("job.outcome", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
