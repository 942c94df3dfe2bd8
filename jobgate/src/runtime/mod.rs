/// Runtime builder for constructing orchestrator instances.
pub mod builder;
/// Worker loops, cancellation wiring and shutdown.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::OrchestratorRuntimeBuilder;
pub use supervisor::{ExecutionOutcome, JobExecutor, OrchestratorRuntime};
pub use worker::WorkerConfig;
