use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the workers of one orchestrator instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    pub worker_count: usize,
    /// Sleep between claim attempts when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// Sleep after a backend error, in milliseconds.
    pub error_backoff_ms: u64,
    /// How often a running job's status is re-read to detect cancellation.
    pub cancel_poll_interval_ms: u64,
    /// Timeout for jobs whose payload does not set one, in seconds.
    pub default_timeout_secs: u64,
    pub heartbeat_interval_ms: u64,
    /// How long shutdown waits for in-flight jobs, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_cancel_poll_interval(mut self, ms: u64) -> Self {
        self.cancel_poll_interval_ms = ms;
        self
    }

    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 250,
            error_backoff_ms: 1_000,
            cancel_poll_interval_ms: 1_000,
            default_timeout_secs: 3_600,
            heartbeat_interval_ms: 5_000,
            shutdown_timeout_secs: 30,
        }
    }
}
