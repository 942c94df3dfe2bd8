use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::MAX_CONFIG_SECS;
use crate::job::{Job, JobStatus};

/// Upper bound on orphans returned or reclaimed in a single call.
pub const MAX_ORPHAN_BATCH: usize = 100;

/// Backoff applied when a recovered job is handed back to the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

/// Computes the requeue delay after `attempts` executions using exponential
/// backoff: `base_delay * 2^(attempts - 1)`, capped at `max_backoff`.
pub fn compute_requeue_delay(attempts: u32, policy: &RecoveryPolicy) -> Duration {
    if attempts == 0 {
        return Duration::milliseconds(0);
    }

    let exp = attempts.saturating_sub(1).min(62) as i32;
    let scaled = (policy.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled
        .min(policy.max_backoff_ms as f64)
        .min((MAX_CONFIG_SECS * 1_000) as f64);
    Duration::milliseconds(capped.max(0.0) as i64)
}

/// Decision taken for one orphaned job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryOutcome {
    /// Hand the job back to the queue after `delay_ms`.
    Requeued { delay_ms: u64 },
    /// Force the job to `FAILED`.
    Failed { reason: String },
}

/// Decides what happens to a job whose orchestrator went away.
///
/// - a `CLAIMED` job never ran, so it is released without spending an attempt
/// - a `RUNNING` job past its timeout fails as timed out
/// - any other `RUNNING` job is retried while attempts remain
pub fn decide_orphan(job: &Job, now: DateTime<Utc>, policy: &RecoveryPolicy) -> RecoveryOutcome {
    match job.status {
        JobStatus::Claimed => RecoveryOutcome::Requeued { delay_ms: 0 },
        JobStatus::Running if job.is_overdue(now) => RecoveryOutcome::Failed {
            reason: "job timed out while its orchestrator was unavailable".into(),
        },
        JobStatus::Running if job.has_retries_left() => RecoveryOutcome::Requeued {
            delay_ms: compute_requeue_delay(job.attempts, policy).num_milliseconds() as u64,
        },
        JobStatus::Running => RecoveryOutcome::Failed {
            reason: format!(
                "orchestrator lost after {} of {} attempts",
                job.attempts,
                job.max_attempts()
            ),
        },
        other => RecoveryOutcome::Failed {
            reason: format!("job in state {other} is not recoverable"),
        },
    }
}
