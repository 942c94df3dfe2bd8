use std::fmt;
use std::sync::Arc;

use crate::job::OrchestratorId;
use crate::recovery::HeartbeatRegistry;
use crate::service::JobService;

use super::supervisor::{JobExecutor, OrchestratorRuntime};
use super::worker::WorkerConfig;

/// Builder for constructing an `OrchestratorRuntime` with explicit dependencies.
///
/// The service and executor are required. Heartbeats are optional; without a
/// registry the instance can only be recovered by an explicit call for its
/// orchestrator identifier.
///
/// # Example
///
/// ```ignore
/// use jobgate::*;
///
/// let runtime = OrchestratorRuntimeBuilder::new("orch-a", WorkerConfig::default())
///     .with_service(service)
///     .with_executor(executor)
///     .with_heartbeats(registry)
///     .build()?;
/// runtime.start().await;
/// ```
pub struct OrchestratorRuntimeBuilder {
    orchestrator_id: OrchestratorId,
    config: WorkerConfig,
    service: Option<Arc<JobService>>,
    executor: Option<Arc<dyn JobExecutor>>,
    heartbeats: Option<Arc<HeartbeatRegistry>>,
}

impl fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("orchestrator_id", &self.orchestrator_id)
            .field("config", &self.config)
            .field("service_set", &self.service.is_some())
            .field("executor_set", &self.executor.is_some())
            .field("heartbeats_set", &self.heartbeats.is_some())
            .finish()
    }
}

impl OrchestratorRuntimeBuilder {
    pub fn new(orchestrator_id: impl Into<OrchestratorId>, config: WorkerConfig) -> Self {
        Self {
            orchestrator_id: orchestrator_id.into(),
            config,
            service: None,
            executor: None,
            heartbeats: None,
        }
    }

    pub fn with_service(mut self, service: Arc<JobService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Register liveness beats so a recovery manager can detect this
    /// instance going away.
    pub fn with_heartbeats(mut self, registry: Arc<HeartbeatRegistry>) -> Self {
        self.heartbeats = Some(registry);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the service or executor is missing, or if the
    /// orchestrator identifier is empty.
    pub fn build(self) -> anyhow::Result<OrchestratorRuntime> {
        if self.orchestrator_id.as_str().trim().is_empty() {
            anyhow::bail!("orchestrator id must not be empty");
        }
        let service = self
            .service
            .ok_or_else(|| anyhow::anyhow!("service dependency missing"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor dependency missing"))?;

        Ok(OrchestratorRuntime::new(
            self.orchestrator_id,
            self.config,
            service,
            executor,
            self.heartbeats,
        ))
    }
}
