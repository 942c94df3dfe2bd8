//! Jobgate - job lifecycle control with quota and rate-limit admission.
//!
//! A crate for services that accept user jobs, hand them to a fleet of
//! orchestrators, and keep per-user consumption in check.
//!
//! # Core Concepts
//!
//! - **Job**: a [`Job`] moves through `QUEUED -> CLAIMED -> RUNNING ->
//!   {COMPLETED | FAILED | CANCELLED}`. Every transition is a conditional
//!   update against a [`JobStore`], so concurrent claimants have exactly one
//!   winner.
//!
//! - **Service**: [`JobService`] is the single entry point for clients
//!   (create, read, list, cancel, stats) and orchestrators (claim, start,
//!   complete, fail, orphan recovery).
//!
//! - **Quota**: [`QuotaManager`] enforces per-user ceilings per [`Resource`]
//!   over daily or monthly windows. Checks never consume.
//!
//! - **Rate limiting**: [`RateLimiter`] counts requests per typed
//!   [`RateLimitKey`] in fixed windows; [`RequestGate`] applies it at the
//!   request boundary and enforces key ownership.
//!
//! - **Runtime**: [`OrchestratorRuntime`] runs worker loops that claim and
//!   execute jobs through a [`JobExecutor`], with cooperative cancellation.
//!   [`RecoveryManager`] reclaims jobs left behind by dead orchestrators.
//!
//! # Feature Flags
//!
//! - `http` (default) - internal orchestrator endpoints via axum
//! - `postgres` - PostgreSQL persistence via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jobgate::*;
//!
//! let service = JobService::new(
//!     Arc::new(InMemoryJobStore::new()),
//!     Arc::new(InMemoryQuotaManager::new(QuotaConfig::default())),
//! );
//! let job = service.create_job(new_job).await?;
//! let claimed = service.claim_job(job.id, &OrchestratorId::new("orch-a")).await?;
//! ```

/// Caller identities and ownership checks.
pub mod auth;

/// Orphan recovery decisions and requeue backoff.
pub mod claim;

/// Injectable time source.
pub mod clock;

/// Layered configuration loading.
///
/// [`JobGateConfig`] merges defaults, an optional TOML file and
/// `JOBGATE__*` environment variables.
pub mod config;

/// Error taxonomy shared by every public operation.
pub mod error;

/// Job lifecycle events.
///
/// [`JobEventBus`] broadcasts a [`JobEvent`] for every applied transition.
pub mod events;

/// Per-attempt execution records.
pub mod execution;

/// Admission control at the request boundary.
pub mod gate;

/// Core job definitions: identifiers, statuses, payloads and the [`Job`]
/// record with its transition methods.
pub mod job;

/// In-process job and execution-log store.
pub mod memory;

/// Per-user quotas over calendar windows.
pub mod quota;

/// Fixed-window rate limiting with typed keys.
pub mod rate_limit;

/// Heartbeats and dead-orchestrator recovery.
pub mod recovery;

/// Orchestrator runtime and worker management.
///
/// Includes:
/// - [`OrchestratorRuntime`] - worker pool with per-job cancellation
/// - [`JobExecutor`] - trait for running job payloads
/// - [`WorkerConfig`] - worker tuning
/// - [`OrchestratorRuntimeBuilder`] - explicit dependency wiring
pub mod runtime;

/// The job service.
pub mod service;

/// Storage traits and transition outcomes.
pub mod store;

/// Tracing setup, spans and metric hooks.
pub mod telemetry;

/// Usage reports over recorded consumption.
pub mod usage;

#[cfg(feature = "http")]
/// Internal HTTP endpoints for orchestrators.
pub mod internal_api;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
pub mod persistence;

pub use auth::*;
pub use claim::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use execution::*;
pub use gate::*;
pub use job::*;
pub use memory::*;
pub use quota::*;
pub use rate_limit::*;
pub use recovery::*;
pub use runtime::*;
pub use service::*;
pub use store::*;
pub use usage::*;

#[cfg(feature = "postgres")]
pub use persistence::PostgresJobStore;
