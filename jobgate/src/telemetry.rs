//! Tracing spans and event helpers for the job lifecycle.
//!
//! Each `record_*` helper logs through `tracing` and, when the `metrics`
//! feature is enabled, updates the matching Prometheus series.

use std::future::Future;

use tracing::{Instrument, Span, info_span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::job::{JobId, JobStatus, JobType, OrchestratorId};
use crate::quota::Resource;
use crate::rate_limit::RateLimitKeyKind;

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back
/// to `default_filter`. Returns an error if a subscriber is already set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Span covering one service-level operation on a job.
#[must_use]
pub fn job_span(job_id: JobId, action: &'static str) -> Span {
    info_span!("jobgate.job", job_id = %job_id, action)
}

/// Span covering one claim attempt by an orchestrator worker.
#[must_use]
pub fn claim_span(orchestrator_id: &OrchestratorId, worker: usize) -> Span {
    info_span!("jobgate.claim", orchestrator_id = %orchestrator_id, worker)
}

#[must_use]
pub fn execution_span(job_id: JobId, job_type: JobType, attempt: u32) -> Span {
    info_span!(
        "jobgate.execute",
        job_id = %job_id,
        job_type = %job_type,
        attempt,
    )
}

#[must_use]
pub fn recovery_span(orchestrator_id: &OrchestratorId) -> Span {
    info_span!("jobgate.recovery", orchestrator_id = %orchestrator_id)
}

/// Attaches an execution span to a future.
pub fn instrument_execution<F>(
    job_id: JobId,
    job_type: JobType,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(execution_span(job_id, job_type, attempt))
}

pub fn record_job_created(job_id: JobId, job_type: JobType) {
    tracing::info!(job_id = %job_id, job_type = %job_type, "job created");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_created(job_type.as_str());
}

/// A job reached a terminal state.
pub fn record_job_finished(job_id: JobId, job_type: JobType, status: JobStatus) {
    tracing::info!(job_id = %job_id, job_type = %job_type, status = %status, "job finished");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(job_type.as_str(), status.as_str());
}

pub fn record_claim_conflict(job_id: JobId, orchestrator_id: &OrchestratorId) {
    tracing::debug!(job_id = %job_id, orchestrator_id = %orchestrator_id, "claim lost");

    #[cfg(feature = "metrics")]
    crate::metrics::record_claim_conflict();
}

pub fn record_quota_rejected(resource: Resource) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_quota_rejected(resource.as_str());

    #[cfg(not(feature = "metrics"))]
    let _ = resource;
}

pub fn record_rate_limited(kind: RateLimitKeyKind) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_rate_limited(kind.as_str());

    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

pub fn record_orphans_recovered(orchestrator_id: &OrchestratorId, requeued: usize, failed: usize) {
    tracing::warn!(
        orchestrator_id = %orchestrator_id,
        requeued,
        failed,
        "orphaned jobs recovered"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_orphans_recovered(requeued as u64, failed as u64);
}

pub fn observe_job_duration(job_type: JobType, status: JobStatus, duration_secs: f64) {
    tracing::debug!(job_type = %job_type, status = %status, duration_secs, "job duration observed");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(job_type.as_str(), status.as_str(), duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let span = job_span(JobId::new(), "cancel");
        assert_eq!(span.metadata().unwrap().name(), "jobgate.job");

        let span = claim_span(&"orch-a".into(), 0);
        assert_eq!(span.metadata().unwrap().name(), "jobgate.claim");

        let span = execution_span(JobId::new(), JobType::Script, 1);
        assert_eq!(span.metadata().unwrap().name(), "jobgate.execute");
    }

    #[test]
    fn test_init_tracing_twice_is_an_error_not_a_panic() {
        let _ = init_tracing("info");
        assert!(init_tracing("info").is_err());
    }
}
