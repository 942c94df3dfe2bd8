//! Fixed-window rate limiting.
//!
//! Every (key, route) pair owns a window holding a request count and the
//! instant the window ends. A request first increments the count and is then
//! admitted only if the count is within the limit. The window starts over
//! once the clock has moved strictly past `reset_at`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock, bounded_seconds};
use crate::error::JobGateResult;
use crate::job::UserId;

/// Identity a limit is applied to.
///
/// Each variant renders into its own namespace, so keys of different types
/// never share a counter even if their raw identifiers coincide.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitKey {
    User { user_id: UserId },
    Ip { addr: String },
    ApiKey { owner: UserId, key_id: String },
    Tool { owner: UserId, tool: String },
    Webhook { owner: UserId, webhook_id: String },
    Custom { key: String },
}

/// Variant tag of a [`RateLimitKey`], used to pick its configured limit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeyKind {
    User,
    Ip,
    ApiKey,
    Tool,
    Webhook,
    Custom,
}

impl RateLimitKeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitKeyKind::User => "user",
            RateLimitKeyKind::Ip => "ip",
            RateLimitKeyKind::ApiKey => "api_key",
            RateLimitKeyKind::Tool => "tool",
            RateLimitKeyKind::Webhook => "webhook",
            RateLimitKeyKind::Custom => "custom",
        }
    }
}

impl fmt::Display for RateLimitKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RateLimitKey {
    pub fn user(user_id: UserId) -> Self {
        Self::User { user_id }
    }

    pub fn ip(addr: impl Into<String>) -> Self {
        Self::Ip { addr: addr.into() }
    }

    pub fn api_key(owner: UserId, key_id: impl Into<String>) -> Self {
        Self::ApiKey {
            owner,
            key_id: key_id.into(),
        }
    }

    pub fn tool(owner: UserId, tool: impl Into<String>) -> Self {
        Self::Tool {
            owner,
            tool: tool.into(),
        }
    }

    pub fn webhook(owner: UserId, webhook_id: impl Into<String>) -> Self {
        Self::Webhook {
            owner,
            webhook_id: webhook_id.into(),
        }
    }

    pub fn custom(key: impl Into<String>) -> Self {
        Self::Custom { key: key.into() }
    }

    pub fn kind(&self) -> RateLimitKeyKind {
        match self {
            Self::User { .. } => RateLimitKeyKind::User,
            Self::Ip { .. } => RateLimitKeyKind::Ip,
            Self::ApiKey { .. } => RateLimitKeyKind::ApiKey,
            Self::Tool { .. } => RateLimitKeyKind::Tool,
            Self::Webhook { .. } => RateLimitKeyKind::Webhook,
            Self::Custom { .. } => RateLimitKeyKind::Custom,
        }
    }

    /// User the key belongs to. IP and custom keys have no owner.
    pub fn owner(&self) -> Option<UserId> {
        match self {
            Self::User { user_id } => Some(*user_id),
            Self::ApiKey { owner, .. } | Self::Tool { owner, .. } | Self::Webhook { owner, .. } => {
                Some(*owner)
            }
            Self::Ip { .. } | Self::Custom { .. } => None,
        }
    }

    /// Flat key for logs and shared stores.
    pub fn to_cache_key(&self, namespace: &str) -> String {
        match self {
            Self::User { user_id } => format!("{namespace}:user:{user_id}"),
            Self::Ip { addr } => format!("{namespace}:ip:{addr}"),
            Self::ApiKey { owner, key_id } => format!("{namespace}:api_key:{owner}:{key_id}"),
            Self::Tool { owner, tool } => format!("{namespace}:tool:{owner}:{tool}"),
            Self::Webhook { owner, webhook_id } => {
                format!("{namespace}:webhook:{owner}:{webhook_id}")
            }
            Self::Custom { key } => format!("{namespace}:custom:{key}"),
        }
    }
}

/// Limit applied to one key type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        bounded_seconds(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(100, 60)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests counted in the current window, including this one.
    pub current_count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatistics {
    pub tracked_keys: usize,
    pub total_requests: u64,
    pub total_rejected: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Counts a request, then decides whether it is admitted.
    async fn check_and_increment(
        &self,
        key: &RateLimitKey,
        route: &str,
        config: &RateLimitConfig,
    ) -> JobGateResult<RateLimitDecision>;

    /// Current window without counting a request.
    async fn get_status(
        &self,
        key: &RateLimitKey,
        route: &str,
        config: &RateLimitConfig,
    ) -> JobGateResult<RateLimitStatus>;

    async fn reset(&self, key: &RateLimitKey, route: &str) -> JobGateResult<()>;

    /// Drops windows that have ended. Returns how many were removed.
    async fn cleanup_expired(&self) -> JobGateResult<u64>;

    async fn statistics(&self) -> JobGateResult<RateLimitStatistics>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: DateTime<Utc>,
}

pub struct InMemoryRateLimiter {
    windows: DashMap<(RateLimitKey, String), Window>,
    total_requests: AtomicU64,
    total_rejected: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRateLimiter")
            .field("tracked_keys", &self.windows.len())
            .field("total_requests", &self.total_requests.load(Ordering::Relaxed))
            .field("total_rejected", &self.total_rejected.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            clock,
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_increment(
        &self,
        key: &RateLimitKey,
        route: &str,
        config: &RateLimitConfig,
    ) -> JobGateResult<RateLimitDecision> {
        let now = self.clock.now();
        let window = {
            let mut entry = self
                .windows
                .entry((key.clone(), route.to_string()))
                .or_insert(Window {
                    count: 0,
                    reset_at: now + config.window(),
                });
            if now > entry.reset_at {
                entry.count = 0;
                entry.reset_at = now + config.window();
            }
            entry.count += 1;
            *entry
        };

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let allowed = window.count <= config.max_requests;
        if !allowed {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key.to_cache_key(route),
                count = window.count,
                limit = config.max_requests,
                "rate limit exceeded"
            );
            crate::telemetry::record_rate_limited(key.kind());
        }

        Ok(RateLimitDecision {
            allowed,
            current_count: window.count,
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(window.count),
            reset_at: window.reset_at,
        })
    }

    async fn get_status(
        &self,
        key: &RateLimitKey,
        route: &str,
        config: &RateLimitConfig,
    ) -> JobGateResult<RateLimitStatus> {
        let now = self.clock.now();
        let window = self
            .windows
            .get(&(key.clone(), route.to_string()))
            .map(|w| *w)
            .filter(|w| now <= w.reset_at);

        Ok(match window {
            Some(window) => RateLimitStatus {
                limit: config.max_requests,
                remaining: config.max_requests.saturating_sub(window.count),
                reset_at: window.reset_at,
            },
            None => RateLimitStatus {
                limit: config.max_requests,
                remaining: config.max_requests,
                reset_at: now + config.window(),
            },
        })
    }

    async fn reset(&self, key: &RateLimitKey, route: &str) -> JobGateResult<()> {
        self.windows.remove(&(key.clone(), route.to_string()));
        Ok(())
    }

    async fn cleanup_expired(&self) -> JobGateResult<u64> {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now <= window.reset_at);
        let removed = before.saturating_sub(self.windows.len()) as u64;
        if removed > 0 {
            debug!(removed, "expired rate-limit windows dropped");
        }
        Ok(removed)
    }

    async fn statistics(&self) -> JobGateResult<RateLimitStatistics> {
        Ok(RateLimitStatistics {
            tracked_keys: self.windows.len(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        })
    }
}

/// Sweeps ended windows out of `limiter` every `interval` until `shutdown`
/// is cancelled.
pub fn spawn_cleanup(
    limiter: Arc<dyn RateLimiter>,
    interval: StdDuration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = limiter.cleanup_expired().await {
                        warn!(error = %err, "rate-limit cleanup failed");
                    }
                }
            }
        }
        debug!("rate-limit cleanup stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct TestClock(Mutex<DateTime<Utc>>);

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    #[test]
    fn test_cache_keys_are_namespaced_by_type() {
        let owner = UserId(uuid::Uuid::nil());
        assert_eq!(
            RateLimitKey::user(owner).to_cache_key("jobs"),
            format!("jobs:user:{}", uuid::Uuid::nil())
        );
        assert_eq!(RateLimitKey::ip("10.0.0.1").to_cache_key("jobs"), "jobs:ip:10.0.0.1");
        assert_ne!(
            RateLimitKey::custom("abc").to_cache_key("r"),
            RateLimitKey::ip("abc").to_cache_key("r")
        );
    }

    #[test]
    fn test_owner() {
        let owner = UserId::new();
        assert_eq!(RateLimitKey::webhook(owner, "wh-1").owner(), Some(owner));
        assert_eq!(RateLimitKey::ip("1.2.3.4").owner(), None);
        assert_eq!(RateLimitKey::custom("batch").owner(), None);
    }

    #[tokio::test]
    async fn test_same_identifier_different_types_do_not_collide() {
        let limiter = InMemoryRateLimiter::new();
        let config = RateLimitConfig::new(1, 60);
        let owner = UserId::new();

        let tool = RateLimitKey::tool(owner, "shared-id");
        let webhook = RateLimitKey::webhook(owner, "shared-id");
        assert!(limiter.check_and_increment(&tool, "run", &config).await.unwrap().allowed);
        assert!(limiter.check_and_increment(&webhook, "run", &config).await.unwrap().allowed);
        assert!(!limiter.check_and_increment(&tool, "run", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_resets_strictly_after_reset_at() {
        let start = Utc::now();
        let clock = Arc::new(TestClock(Mutex::new(start)));
        let limiter = InMemoryRateLimiter::with_clock(clock.clone());
        let key = RateLimitKey::ip("192.168.1.1");
        let config = RateLimitConfig::new(2, 10);

        assert!(limiter.check_and_increment(&key, "jobs", &config).await.unwrap().allowed);
        assert!(limiter.check_and_increment(&key, "jobs", &config).await.unwrap().allowed);
        let third = limiter.check_and_increment(&key, "jobs", &config).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);

        *clock.0.lock() = third.reset_at;
        assert!(!limiter.check_and_increment(&key, "jobs", &config).await.unwrap().allowed);

        *clock.0.lock() = third.reset_at + Duration::milliseconds(1);
        let fresh = limiter.check_and_increment(&key, "jobs", &config).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.current_count, 1);
    }

    #[tokio::test]
    async fn test_status_does_not_count() {
        let limiter = InMemoryRateLimiter::new();
        let key = RateLimitKey::user(UserId::new());
        let config = RateLimitConfig::new(3, 60);

        limiter.check_and_increment(&key, "jobs", &config).await.unwrap();
        for _ in 0..3 {
            let status = limiter.get_status(&key, "jobs", &config).await.unwrap();
            assert_eq!(status.remaining, 2);
        }
        let stats = limiter.statistics().await.unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.tracked_keys, 1);
    }

    #[tokio::test]
    async fn test_cleanup_and_reset() {
        let start = Utc::now();
        let clock = Arc::new(TestClock(Mutex::new(start)));
        let limiter = InMemoryRateLimiter::with_clock(clock.clone());
        let config = RateLimitConfig::new(1, 5);
        let a = RateLimitKey::custom("a");
        let b = RateLimitKey::custom("b");

        limiter.check_and_increment(&a, "r", &config).await.unwrap();
        limiter.check_and_increment(&b, "r", &config).await.unwrap();
        limiter.reset(&a, "r").await.unwrap();
        assert!(limiter.check_and_increment(&a, "r", &config).await.unwrap().allowed);

        *clock.0.lock() = start + Duration::seconds(6);
        assert_eq!(limiter.cleanup_expired().await.unwrap(), 2);
        assert_eq!(limiter.statistics().await.unwrap().tracked_keys, 0);
    }
}
