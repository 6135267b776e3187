//! Prometheus metrics instrumentation for penstock.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `penstock_jobs_enqueued_total` - Total number of jobs enqueued
//! - `penstock_jobs_finished_total` - Handler attempts by outcome (completed, retry, failed, lost, error)
//!
//! ## Gauges
//! - `penstock_jobs_active` - Jobs currently executing in this process
//!
//! ## Histograms
//! - `penstock_job_duration_seconds` - Handler execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for penstock metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for total jobs enqueued.
///
/// Labels:
/// - `job_type`: The job type
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("penstock_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["job_type"]).expect("penstock_jobs_enqueued_total metric creation failed")
});

/// Counter for handler attempts by outcome.
///
/// Labels:
/// - `job_type`: The job type
/// - `outcome`: completed, retry, failed, lost or error
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "penstock_jobs_finished_total",
        "Total number of handler attempts by outcome",
    );
    CounterVec::new(opts, &["job_type", "outcome"])
        .expect("penstock_jobs_finished_total metric creation failed")
});

/// Gauge for jobs currently executing.
pub static JOBS_ACTIVE: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("penstock_jobs_active", "Jobs currently executing in this process")
        .expect("penstock_jobs_active metric creation failed")
});

/// Histogram for handler execution duration in seconds.
///
/// Labels:
/// - `job_type`: The job type
/// - `outcome`: completed, retry, failed, lost or error
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 14).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "penstock_job_duration_seconds",
        "Handler execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "outcome"])
        .expect("penstock_job_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_ACTIVE.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_finished(job_type: &str, outcome: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, outcome])
        .inc();
}

pub fn set_active_jobs(active: f64) {
    JOBS_ACTIVE.set(active);
}

pub fn observe_job_duration(job_type: &str, outcome: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_enqueued("echo");
        record_job_finished("echo", "completed");
        record_job_finished("echo", "retry");
        set_active_jobs(2.0);
        observe_job_duration("echo", "completed", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("penstock_jobs_enqueued_total"));
        assert!(output.contains("penstock_jobs_finished_total"));
        assert!(output.contains("penstock_jobs_active"));
        assert!(output.contains("penstock_job_duration_seconds"));
    }
}
