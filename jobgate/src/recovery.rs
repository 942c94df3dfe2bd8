//! Detects dead orchestrators and reclaims the jobs they left behind.
//!
//! Running orchestrators beat into a [`HeartbeatRegistry`]. A
//! [`RecoveryManager`] periodically asks the registry which instances have
//! gone quiet and hands each of them to [`JobService::recover_orphans`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, bounded_seconds};
use crate::job::OrchestratorId;
use crate::service::JobService;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Delay between recovery ticks, in milliseconds.
    pub interval_ms: u64,
    /// An orchestrator whose last beat is older than this is considered dead.
    pub heartbeat_timeout_secs: u64,
    /// Upper bound on orphan batches reclaimed per orchestrator per tick.
    pub max_batches_per_tick: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            heartbeat_timeout_secs: 30,
            max_batches_per_tick: 10,
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_millis(self.interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        bounded_seconds(self.heartbeat_timeout_secs)
    }
}

/// Last liveness beat per orchestrator instance.
#[derive(Debug)]
pub struct HeartbeatRegistry {
    beats: DashMap<OrchestratorId, DateTime<Utc>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl HeartbeatRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            beats: DashMap::new(),
            timeout,
            clock,
        }
    }

    pub fn beat(&self, orchestrator_id: &OrchestratorId) {
        self.beats.insert(orchestrator_id.clone(), self.clock.now());
    }

    pub fn last_seen(&self, orchestrator_id: &OrchestratorId) -> Option<DateTime<Utc>> {
        self.beats.get(orchestrator_id).map(|entry| *entry.value())
    }

    pub fn is_alive(&self, orchestrator_id: &OrchestratorId) -> bool {
        self.last_seen(orchestrator_id)
            .is_some_and(|seen| self.clock.now() - seen <= self.timeout)
    }

    /// Orchestrators whose last beat is older than the timeout, sorted by name.
    pub fn dead_orchestrators(&self) -> Vec<OrchestratorId> {
        let now = self.clock.now();
        let mut dead: Vec<OrchestratorId> = self
            .beats
            .iter()
            .filter(|entry| now - *entry.value() > self.timeout)
            .map(|entry| entry.key().clone())
            .collect();
        dead.sort();
        dead
    }

    /// Drops an orchestrator from the registry once nothing is left to reclaim.
    pub fn forget(&self, orchestrator_id: &OrchestratorId) -> bool {
        self.beats.remove(orchestrator_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }
}

/// Totals for one recovery tick.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub orchestrators: usize,
    pub requeued: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone, Debug)]
pub struct RecoveryManager {
    service: Arc<JobService>,
    registry: Arc<HeartbeatRegistry>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        service: Arc<JobService>,
        registry: Arc<HeartbeatRegistry>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            service,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<HeartbeatRegistry> {
        &self.registry
    }

    /// One recovery pass over every dead orchestrator.
    ///
    /// Batches are reclaimed until one makes no progress or the per-tick
    /// bound is hit. An orchestrator is forgotten only after a read shows it
    /// holds no jobs; otherwise it is revisited next tick.
    pub async fn run_once(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for orchestrator_id in self.registry.dead_orchestrators() {
            report.orchestrators += 1;
            for _ in 0..self.config.max_batches_per_tick.max(1) {
                match self.service.recover_orphans(&orchestrator_id).await {
                    Ok(summary) => {
                        report.requeued += summary.requeued;
                        report.failed += summary.failed;
                        report.skipped += summary.skipped;
                        if summary.handled() == 0 {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%orchestrator_id, error = %err, "orphan recovery failed, retrying next tick");
                        break;
                    }
                }
            }

            match self.service.orphaned_jobs(&orchestrator_id, 1).await {
                Ok(remaining) if remaining.is_empty() => {
                    self.registry.forget(&orchestrator_id);
                    info!(%orchestrator_id, "dead orchestrator fully recovered");
                }
                Ok(_) => debug!(%orchestrator_id, "orphans remain after recovery tick"),
                Err(err) => warn!(%orchestrator_id, error = %err, "could not confirm recovery"),
            }
        }

        if report.requeued + report.failed > 0 {
            info!(
                orchestrators = report.orchestrators,
                requeued = report.requeued,
                failed = report.failed,
                skipped = report.skipped,
                "recovery tick finished"
            );
        }
        report
    }

    /// Runs [`RecoveryManager::run_once`] every `interval` until `shutdown`
    /// is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.interval();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        self.run_once().await;
                    }
                }
            }
            debug!("recovery manager stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct TestClock(Mutex<DateTime<Utc>>);

    impl TestClock {
        fn advance(&self, by: Duration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    #[test]
    fn test_orchestrator_dies_after_timeout() {
        let clock = Arc::new(TestClock(Mutex::new(Utc::now())));
        let registry = HeartbeatRegistry::with_clock(Duration::seconds(30), clock.clone());
        let a = OrchestratorId::new("orch-a");
        let b = OrchestratorId::new("orch-b");

        registry.beat(&a);
        clock.advance(Duration::seconds(20));
        registry.beat(&b);
        assert!(registry.dead_orchestrators().is_empty());

        clock.advance(Duration::seconds(11));
        assert_eq!(registry.dead_orchestrators(), vec![a.clone()]);
        assert!(!registry.is_alive(&a));
        assert!(registry.is_alive(&b));

        registry.beat(&a);
        assert!(registry.dead_orchestrators().is_empty());
    }

    #[test]
    fn test_forget_removes_entry() {
        let registry = HeartbeatRegistry::new(Duration::seconds(1));
        let a = OrchestratorId::new("orch-a");
        registry.beat(&a);
        assert!(registry.forget(&a));
        assert!(!registry.forget(&a));
        assert!(registry.is_empty());
        assert_eq!(registry.last_seen(&a), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.interval(), StdDuration::from_secs(10));
        assert_eq!(config.heartbeat_timeout(), Duration::seconds(30));
    }
}
