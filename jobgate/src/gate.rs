use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::Caller;
use crate::error::{JobGateError, JobGateResult};
use crate::rate_limit::{
    RateLimitConfig, RateLimitDecision, RateLimitKey, RateLimitKeyKind, RateLimitStatistics,
    RateLimitStatus, RateLimiter, spawn_cleanup,
};

/// Limits per key type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub user: RateLimitConfig,
    pub ip: RateLimitConfig,
    pub api_key: RateLimitConfig,
    pub tool: RateLimitConfig,
    pub webhook: RateLimitConfig,
    pub custom: RateLimitConfig,
    /// Seconds between sweeps of ended windows.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            user: RateLimitConfig::new(100, 60),
            ip: RateLimitConfig::new(300, 60),
            api_key: RateLimitConfig::new(1_000, 3_600),
            tool: RateLimitConfig::new(60, 60),
            webhook: RateLimitConfig::new(30, 60),
            custom: RateLimitConfig::new(100, 60),
            cleanup_interval_secs: 60,
        }
    }
}

impl RateLimitSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn for_kind(&self, kind: RateLimitKeyKind) -> &RateLimitConfig {
        match kind {
            RateLimitKeyKind::User => &self.user,
            RateLimitKeyKind::Ip => &self.ip,
            RateLimitKeyKind::ApiKey => &self.api_key,
            RateLimitKeyKind::Tool => &self.tool,
            RateLimitKeyKind::Webhook => &self.webhook,
            RateLimitKeyKind::Custom => &self.custom,
        }
    }
}

/// Request admission in front of the job service.
///
/// Also the place where key ownership is enforced: a user may only look at
/// windows of keys they own, while ownerless keys (IP, custom) are visible
/// to administrators only.
#[derive(Clone, Debug)]
pub struct RequestGate {
    limiter: Arc<dyn RateLimiter>,
    settings: RateLimitSettings,
}

impl RequestGate {
    pub fn new(limiter: Arc<dyn RateLimiter>, settings: RateLimitSettings) -> Self {
        Self { limiter, settings }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Counts the request against `key` and fails with `RateLimited` once the
    /// window is exhausted.
    pub async fn admit(&self, key: &RateLimitKey, route: &str) -> JobGateResult<RateLimitDecision> {
        let config = self.settings.for_kind(key.kind());
        let decision = self.limiter.check_and_increment(key, route, config).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(JobGateError::RateLimited {
                retry_after: decision.reset_at,
            })
        }
    }

    pub async fn status_for(
        &self,
        caller: &Caller,
        key: &RateLimitKey,
        route: &str,
    ) -> JobGateResult<RateLimitStatus> {
        ensure_key_access(caller, key)?;
        self.limiter
            .get_status(key, route, self.settings.for_kind(key.kind()))
            .await
    }

    pub async fn reset(&self, caller: &Caller, key: &RateLimitKey, route: &str) -> JobGateResult<()> {
        caller.ensure_admin()?;
        self.limiter.reset(key, route).await
    }

    pub async fn statistics(&self, caller: &Caller) -> JobGateResult<RateLimitStatistics> {
        caller.ensure_admin()?;
        self.limiter.statistics().await
    }

    pub async fn cleanup_expired(&self) -> JobGateResult<u64> {
        self.limiter.cleanup_expired().await
    }

    /// Starts the periodic window sweep at `cleanup_interval_secs`.
    pub fn spawn_cleanup(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        spawn_cleanup(
            Arc::clone(&self.limiter),
            self.settings.cleanup_interval(),
            shutdown,
        )
    }
}

fn ensure_key_access(caller: &Caller, key: &RateLimitKey) -> JobGateResult<()> {
    match key.owner() {
        Some(owner) => caller.ensure_owner(owner),
        None => caller.ensure_admin(),
    }
}
