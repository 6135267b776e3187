//! Tracing and telemetry instrumentation for penstock.
//!
//! This module provides helper functions for creating tracing spans and recording
//! metrics during job lifecycle events. All functions work both with and without
//! the `metrics` feature flag.
//!
//! # Features
//!
//! - Tracing spans for job lifecycle: enqueue, claim, dispatch, complete
//! - Integration with the `metrics` module for Prometheus metrics
//! - Subscriber installation for binaries and demos
//!
//! # Example
//!
//! ```ignore
//! use penstock::telemetry::{dispatch_span, record_job_enqueued};
//!
//! let span = dispatch_span(job_id, "analyze_entry", 1);
//! let _enter = span.enter();
//! // ... job execution
//! record_job_enqueued("analyze_entry");
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

/// Create a tracing span for enqueue operations.
#[must_use]
pub fn enqueue_span(job_type: impl AsRef<str>) -> Span {
    info_span!("penstock.enqueue", job_type = %job_type.as_ref())
}

/// Create a tracing span for one claim round of the scheduling loop.
///
/// # Arguments
/// * `worker_id` - The worker pool identifier
/// * `capacity` - Free execution slots offered to the backend
#[must_use]
pub fn claim_span(worker_id: impl AsRef<str>, capacity: usize) -> Span {
    info_span!(
        "penstock.claim",
        worker_id = %worker_id.as_ref(),
        capacity = capacity,
    )
}

/// Create a tracing span for handler execution.
///
/// The span includes the job_id, job_type and attempt number as fields.
#[must_use]
pub fn dispatch_span(job_id: impl AsRef<str>, job_type: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "penstock.dispatch",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        attempt = attempt,
    )
}

/// Create a tracing span for recording a handler outcome.
///
/// # Arguments
/// * `job_id` - The unique job identifier
/// * `job_type` - The job type
/// * `outcome` - One of `completed`, `retry`, `failed`, `lost`, `error`
#[must_use]
pub fn complete_span(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
) -> Span {
    info_span!(
        "penstock.complete",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
    )
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(job_id, job_type, attempt))
}

/// Record a job enqueue event.
pub fn record_job_enqueued(job_type: impl AsRef<str>) {
    tracing::debug!(job_type = %job_type.as_ref(), "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(job_type.as_ref());
}

/// Record a handler outcome.
///
/// # Arguments
/// * `job_type` - The job type
/// * `outcome` - One of `completed`, `retry`, `failed`, `lost`, `error`
pub fn record_job_finished(job_type: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
        "job attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(job_type.as_ref(), outcome.as_ref());
}

/// Update the active jobs gauge.
pub fn set_active_jobs(active: usize) {
    tracing::trace!(active = active, "active jobs updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_active_jobs(active as f64);
}

/// Observe the duration of a handler execution.
pub fn observe_job_duration(job_type: impl AsRef<str>, outcome: impl AsRef<str>, elapsed: Duration) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
        duration_ms = elapsed.as_millis() as u64,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(job_type.as_ref(), outcome.as_ref(), elapsed.as_secs_f64());
}

/// Record the start of job execution for duration tracking.
///
/// Returns an opaque handle that should be passed to `record_job_end`.
pub fn record_job_start(job_type: impl Into<String>) -> JobTimingHandle {
    JobTimingHandle {
        job_type: job_type.into(),
        start: Instant::now(),
    }
}

/// Record the end of job execution and update outcome and duration metrics.
pub fn record_job_end(handle: JobTimingHandle, outcome: impl AsRef<str>) {
    let elapsed = handle.start.elapsed();
    record_job_finished(&handle.job_type, outcome.as_ref());
    observe_job_duration(&handle.job_type, outcome.as_ref(), elapsed);
}

/// Handle for tracking job execution duration.
///
/// This is an opaque type returned by `record_job_start` and consumed by `record_job_end`.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_type: String,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Install a global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). Set `PENSTOCK_LOG_FORMAT=json`
/// for JSON lines. Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PENSTOCK_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}
