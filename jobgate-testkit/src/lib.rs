//! Test fixtures for jobgate: job request builders, a manual clock, a
//! scriptable executor and a pre-wired in-memory service.

mod clock;
mod job;
mod mock;
mod store;

use std::sync::Arc;

use jobgate::{
    Clock, InMemoryJobStore, InMemoryQuotaManager, JobEventBus, JobService, QuotaConfig,
    ServiceConfig,
};

pub use clock::ManualClock;
pub use job::{JobFixture, script_job};
pub use mock::{ExecutionRecord, ExecutorBehavior, MockExecutor};
pub use store::FaultyJobStore;

/// In-memory service with every collaborator exposed for assertions.
#[derive(Debug, Clone)]
pub struct TestHarness {
    pub service: Arc<JobService>,
    pub store: InMemoryJobStore,
    pub quota: Arc<InMemoryQuotaManager>,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_quota(QuotaConfig::default())
    }

    pub fn with_quota(quota: QuotaConfig) -> Self {
        Self::build(quota, ServiceConfig::default(), Arc::new(ManualClock::fixed()))
    }

    /// Service and quotas read the wall clock; for runtime tests where tokio
    /// timers drive progress. `clock` is not wired into anything.
    pub fn with_system_clock() -> Self {
        let store = InMemoryJobStore::new();
        let quota = Arc::new(InMemoryQuotaManager::new(QuotaConfig::default()));
        let service = JobService::new(Arc::new(store.clone()), quota.clone())
            .with_events(JobEventBus::default());

        Self {
            service: Arc::new(service),
            store,
            quota,
            clock: Arc::new(ManualClock::new(chrono::Utc::now())),
        }
    }

    /// Like [`TestHarness::with_system_clock`], but the service talks to a
    /// [`FaultyJobStore`] wrapped around `store`.
    pub fn with_faulty_store(config: ServiceConfig) -> (Self, FaultyJobStore) {
        let store = InMemoryJobStore::new();
        let faulty = FaultyJobStore::new(store.clone());
        let quota = Arc::new(InMemoryQuotaManager::new(QuotaConfig::default()));
        let service = JobService::new(Arc::new(faulty.clone()), quota.clone())
            .with_config(config)
            .with_events(JobEventBus::default());

        let harness = Self {
            service: Arc::new(service),
            store,
            quota,
            clock: Arc::new(ManualClock::new(chrono::Utc::now())),
        };
        (harness, faulty)
    }

    pub fn build(quota: QuotaConfig, config: ServiceConfig, clock: Arc<ManualClock>) -> Self {
        let store = InMemoryJobStore::new();
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let quota = Arc::new(InMemoryQuotaManager::with_clock(quota, shared_clock.clone()));
        let service = JobService::new(Arc::new(store.clone()), quota.clone())
            .with_config(config)
            .with_events(JobEventBus::default())
            .with_clock(shared_clock);

        Self {
            service: Arc::new(service),
            store,
            quota,
            clock,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
