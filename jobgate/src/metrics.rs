//! Prometheus metrics for jobgate.
//!
//! All metrics are compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `jobgate_jobs_created_total` - jobs accepted by the service
//! - `jobgate_jobs_finished_total` - jobs that reached a terminal state
//! - `jobgate_claim_conflicts_total` - claims lost to another orchestrator
//! - `jobgate_quota_rejections_total` - consumptions rejected by a ceiling
//! - `jobgate_rate_limited_total` - requests rejected by a window
//! - `jobgate_orphans_recovered_total` - orphans requeued or failed by recovery
//!
//! ## Histograms
//! - `jobgate_job_duration_seconds` - execution time of finished jobs
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{CounterVec, HistogramVec, IntCounter, Opts, Registry, exponential_buckets};

/// Registry every jobgate metric is registered with; scraped by
/// [`gather_metrics`].
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Jobs accepted by `create_job`.
///
/// Labels: `job_type`
pub static JOBS_CREATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("jobgate_jobs_created_total", "Total number of jobs created");
    CounterVec::new(opts, &["job_type"]).expect("jobgate_jobs_created_total metric creation failed")
});

/// Jobs that reached `COMPLETED`, `FAILED` or `CANCELLED`, including
/// failures decided by orphan recovery.
///
/// Labels: `job_type`, `status`
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobgate_jobs_finished_total",
        "Total number of jobs that reached a terminal state",
    );
    CounterVec::new(opts, &["job_type", "status"])
        .expect("jobgate_jobs_finished_total metric creation failed")
});

/// Claims that found the job already taken or no longer queued.
pub static CLAIM_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "jobgate_claim_conflicts_total",
        "Claims that lost the conditional update",
    )
    .expect("jobgate_claim_conflicts_total metric creation failed")
});

/// Consumptions refused because the window's ceiling was reached.
///
/// Labels: `resource`
pub static QUOTA_REJECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobgate_quota_rejections_total",
        "Consumptions rejected because a quota ceiling was reached",
    );
    CounterVec::new(opts, &["resource"])
        .expect("jobgate_quota_rejections_total metric creation failed")
});

/// Requests over their window's limit.
///
/// Labels: `key_type`
pub static RATE_LIMITED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobgate_rate_limited_total",
        "Requests rejected by a rate-limit window",
    );
    CounterVec::new(opts, &["key_type"]).expect("jobgate_rate_limited_total metric creation failed")
});

/// Orphans handled by recovery.
///
/// Labels: `outcome` (`requeued` or `failed`)
pub static ORPHANS_RECOVERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobgate_orphans_recovered_total",
        "Orphaned jobs handled by recovery",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("jobgate_orphans_recovered_total metric creation failed")
});

/// Time from `RUNNING` to the reported outcome, 5ms to roughly 3 minutes
/// in doubling buckets.
///
/// Labels: `job_type`, `status`
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "jobgate_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("jobgate_job_duration_seconds metric creation failed")
});

/// Registers every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_CREATED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(CLAIM_CONFLICTS_TOTAL.clone()),
        Box::new(QUOTA_REJECTIONS_TOTAL.clone()),
        Box::new(RATE_LIMITED_TOTAL.clone()),
        Box::new(ORPHANS_RECOVERED_TOTAL.clone()),
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

pub fn record_job_created(job_type: &str) {
    JOBS_CREATED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_finished(job_type: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

pub fn record_claim_conflict() {
    CLAIM_CONFLICTS_TOTAL.inc();
}

pub fn record_quota_rejected(resource: &str) {
    QUOTA_REJECTIONS_TOTAL.with_label_values(&[resource]).inc();
}

pub fn record_rate_limited(key_type: &str) {
    RATE_LIMITED_TOTAL.with_label_values(&[key_type]).inc();
}

pub fn record_orphans_recovered(requeued: u64, failed: u64) {
    ORPHANS_RECOVERED_TOTAL
        .with_label_values(&["requeued"])
        .inc_by(requeued as f64);
    ORPHANS_RECOVERED_TOTAL
        .with_label_values(&["failed"])
        .inc_by(failed as f64);
}

pub fn observe_job_duration(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
