use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::Caller;
use crate::clock::{Clock, SystemClock};
use crate::error::{JobGateError, JobGateResult};
use crate::job::UserId;
use crate::usage::{ReportPeriod, UsageRecord, UsageSource};

/// A metered resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Events,
    Workflows,
    Webhooks,
    ApiCalls,
    Storage,
    /// One unit per created job.
    Executions,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Events,
        Resource::Workflows,
        Resource::Webhooks,
        Resource::ApiCalls,
        Resource::Storage,
        Resource::Executions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Events => "events",
            Resource::Workflows => "workflows",
            Resource::Webhooks => "webhooks",
            Resource::ApiCalls => "api_calls",
            Resource::Storage => "storage",
            Resource::Executions => "executions",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar window (UTC) after which a counter starts again from zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetCadence {
    Daily,
    Monthly,
}

impl ResetCadence {
    /// Start of the window containing `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let date = match self {
            ResetCadence::Daily => date,
            ResetCadence::Monthly => date.with_day(1).unwrap_or(date),
        };
        date.and_time(NaiveTime::MIN).and_utc()
    }

    /// Start of the window following the one that began at `window_start`.
    pub fn next_reset(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ResetCadence::Daily => window_start + Duration::days(1),
            ResetCadence::Monthly => window_start
                .checked_add_months(Months::new(1))
                .unwrap_or(window_start + Duration::days(31)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub limit: u64,
    pub cadence: ResetCadence,
}

impl QuotaLimit {
    pub const fn daily(limit: u64) -> Self {
        Self {
            limit,
            cadence: ResetCadence::Daily,
        }
    }

    pub const fn monthly(limit: u64) -> Self {
        Self {
            limit,
            cadence: ResetCadence::Monthly,
        }
    }
}

/// System-wide default ceilings, one field per resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub events: QuotaLimit,
    pub workflows: QuotaLimit,
    pub webhooks: QuotaLimit,
    pub api_calls: QuotaLimit,
    /// Bytes.
    pub storage: QuotaLimit,
    pub executions: QuotaLimit,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            events: QuotaLimit::monthly(1_000),
            workflows: QuotaLimit::monthly(100),
            webhooks: QuotaLimit::monthly(50),
            api_calls: QuotaLimit::daily(10_000),
            storage: QuotaLimit::monthly(1024 * 1024 * 1024),
            executions: QuotaLimit::daily(5_000),
        }
    }
}

impl QuotaConfig {
    pub fn limit(&self, resource: Resource) -> QuotaLimit {
        match resource {
            Resource::Events => self.events,
            Resource::Workflows => self.workflows,
            Resource::Webhooks => self.webhooks,
            Resource::ApiCalls => self.api_calls,
            Resource::Storage => self.storage,
            Resource::Executions => self.executions,
        }
    }

    pub fn with_limit(mut self, resource: Resource, limit: QuotaLimit) -> Self {
        let slot = match resource {
            Resource::Events => &mut self.events,
            Resource::Workflows => &mut self.workflows,
            Resource::Webhooks => &mut self.webhooks,
            Resource::ApiCalls => &mut self.api_calls,
            Resource::Storage => &mut self.storage,
            Resource::Executions => &mut self.executions,
        };
        *slot = limit;
        self
    }
}

/// Partial per-user ceilings. Resources left out keep the system default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaOverride {
    pub limits: BTreeMap<Resource, u64>,
}

impl QuotaOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, resource: Resource, limit: u64) -> Self {
        self.limits.insert(resource, limit);
        self
    }
}

/// Snapshot of one (user, resource) counter against its ceiling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCheck {
    pub resource: Resource,
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub used: u64,
    pub resets_at: DateTime<Utc>,
}

/// Per-user resource accounting.
///
/// `check_quota` never mutates. `consume` checks and records in one step, so
/// concurrent consumers can never push a counter past its ceiling.
/// `update_user_quota` and `reset_quotas` require an administrator.
#[async_trait]
pub trait QuotaManager: Send + Sync + fmt::Debug {
    async fn check_quota(
        &self,
        user_id: UserId,
        resource: Resource,
        amount: u64,
    ) -> JobGateResult<QuotaCheck>;

    /// Records `amount` units, or fails with `QuotaExceeded` leaving the
    /// counter untouched.
    async fn consume(
        &self,
        user_id: UserId,
        resource: Resource,
        amount: u64,
    ) -> JobGateResult<QuotaCheck>;

    /// Returns units to the pool, saturating at zero.
    async fn release(&self, user_id: UserId, resource: Resource, amount: u64) -> JobGateResult<()>;

    async fn update_user_quota(
        &self,
        caller: &Caller,
        user_id: UserId,
        quota: QuotaOverride,
    ) -> JobGateResult<()>;

    /// Zeroes the given counters, or all of them when `resources` is `None`.
    async fn reset_quotas(
        &self,
        caller: &Caller,
        user_id: UserId,
        resources: Option<&[Resource]>,
    ) -> JobGateResult<()>;

    /// Current state of every resource for a user.
    async fn usage(&self, user_id: UserId) -> JobGateResult<Vec<QuotaCheck>>;
}

#[derive(Debug)]
struct Counter {
    used: u64,
    window_start: DateTime<Utc>,
}

impl Counter {
    fn used_at(&self, window_start: DateTime<Utc>) -> u64 {
        if window_start > self.window_start {
            0
        } else {
            self.used
        }
    }

    fn roll_over(&mut self, window_start: DateTime<Utc>) {
        if window_start > self.window_start {
            self.used = 0;
            self.window_start = window_start;
        }
    }
}

/// In-process quota counters.
///
/// Each (user, resource) pair owns a mutex; consumption, release and reset
/// of that pair all run under it. Counters are not shared between
/// processes, so this only enforces ceilings for a single instance.
pub struct InMemoryQuotaManager {
    config: QuotaConfig,
    counters: DashMap<(UserId, Resource), Arc<Mutex<Counter>>>,
    overrides: DashMap<UserId, QuotaOverride>,
    /// Consumption and refunds, oldest first, trimmed to
    /// [`ReportPeriod::retention`].
    history: Mutex<VecDeque<UsageRecord>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryQuotaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryQuotaManager")
            .field("config", &self.config)
            .field("counters", &self.counters.len())
            .field("overrides", &self.overrides.len())
            .field("history", &self.history.lock().len())
            .finish()
    }
}

impl InMemoryQuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            overrides: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    fn record(&self, user_id: UserId, resource: Resource, amount: i64, now: DateTime<Utc>) {
        let horizon = now - ReportPeriod::retention();
        let mut history = self.history.lock();
        while history.front().is_some_and(|r| r.recorded_at < horizon) {
            history.pop_front();
        }
        history.push_back(UsageRecord {
            user_id,
            resource,
            amount,
            recorded_at: now,
        });
    }

    fn effective_limit(&self, user_id: UserId, resource: Resource) -> QuotaLimit {
        let default = self.config.limit(resource);
        match self
            .overrides
            .get(&user_id)
            .and_then(|o| o.limits.get(&resource).copied())
        {
            Some(limit) => QuotaLimit { limit, ..default },
            None => default,
        }
    }

    fn counter(&self, user_id: UserId, resource: Resource, window_start: DateTime<Utc>) -> Arc<Mutex<Counter>> {
        self.counters
            .entry((user_id, resource))
            .or_insert_with(|| {
                Arc::new(Mutex::new(Counter {
                    used: 0,
                    window_start,
                }))
            })
            .value()
            .clone()
    }

    fn snapshot(
        resource: Resource,
        limit: QuotaLimit,
        used: u64,
        amount: u64,
        window_start: DateTime<Utc>,
    ) -> QuotaCheck {
        QuotaCheck {
            resource,
            allowed: used.saturating_add(amount) <= limit.limit,
            remaining: limit.limit.saturating_sub(used),
            limit: limit.limit,
            used,
            resets_at: limit.cadence.next_reset(window_start),
        }
    }

    fn read(&self, user_id: UserId, resource: Resource, amount: u64) -> QuotaCheck {
        let limit = self.effective_limit(user_id, resource);
        let window_start = limit.cadence.window_start(self.clock.now());
        let used = self
            .counters
            .get(&(user_id, resource))
            .map(|counter| counter.lock().used_at(window_start))
            .unwrap_or(0);
        Self::snapshot(resource, limit, used, amount, window_start)
    }
}

#[async_trait]
impl QuotaManager for InMemoryQuotaManager {
    async fn check_quota(
        &self,
        user_id: UserId,
        resource: Resource,
        amount: u64,
    ) -> JobGateResult<QuotaCheck> {
        Ok(self.read(user_id, resource, amount))
    }

    async fn consume(
        &self,
        user_id: UserId,
        resource: Resource,
        amount: u64,
    ) -> JobGateResult<QuotaCheck> {
        let now = self.clock.now();
        let limit = self.effective_limit(user_id, resource);
        let window_start = limit.cadence.window_start(now);
        let counter = self.counter(user_id, resource, window_start);

        let check = {
            let mut counter = counter.lock();
            counter.roll_over(window_start);
            let before = Self::snapshot(resource, limit, counter.used, amount, window_start);
            if !before.allowed {
                debug!(%user_id, %resource, used = counter.used, limit = limit.limit, amount, "quota exceeded");
                crate::telemetry::record_quota_rejected(resource);
                return Err(JobGateError::QuotaExceeded {
                    resource,
                    limit: limit.limit,
                    used: counter.used,
                    requested: amount,
                });
            }
            counter.used += amount;
            Self::snapshot(resource, limit, counter.used, 0, window_start)
        };

        self.record(user_id, resource, i64::try_from(amount).unwrap_or(i64::MAX), now);
        Ok(check)
    }

    async fn release(&self, user_id: UserId, resource: Resource, amount: u64) -> JobGateResult<()> {
        let Some(counter) = self.counters.get(&(user_id, resource)).map(|c| c.value().clone()) else {
            return Ok(());
        };
        let refunded = {
            let mut counter = counter.lock();
            let refunded = amount.min(counter.used);
            counter.used -= refunded;
            refunded
        };
        if refunded > 0 {
            let now = self.clock.now();
            self.record(user_id, resource, -i64::try_from(refunded).unwrap_or(i64::MAX), now);
        }
        Ok(())
    }

    async fn update_user_quota(
        &self,
        caller: &Caller,
        user_id: UserId,
        quota: QuotaOverride,
    ) -> JobGateResult<()> {
        caller.ensure_admin()?;
        info!(%user_id, admin = %caller.user_id, limits = ?quota.limits, "updating user quota");
        self.overrides
            .entry(user_id)
            .or_default()
            .limits
            .extend(quota.limits);
        Ok(())
    }

    async fn reset_quotas(
        &self,
        caller: &Caller,
        user_id: UserId,
        resources: Option<&[Resource]>,
    ) -> JobGateResult<()> {
        caller.ensure_admin()?;
        let resources = resources.unwrap_or(&Resource::ALL);
        let now = self.clock.now();
        for &resource in resources {
            let window_start = self.effective_limit(user_id, resource).cadence.window_start(now);
            let counter = self.counter(user_id, resource, window_start);
            let mut counter = counter.lock();
            counter.used = 0;
            counter.window_start = window_start;
        }
        info!(%user_id, admin = %caller.user_id, ?resources, "quota counters reset");
        Ok(())
    }

    async fn usage(&self, user_id: UserId) -> JobGateResult<Vec<QuotaCheck>> {
        Ok(Resource::ALL
            .into_iter()
            .map(|resource| self.read(user_id, resource, 0))
            .collect())
    }
}

#[async_trait]
impl UsageSource for InMemoryQuotaManager {
    async fn usage_records(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageRecord>> {
        Ok(self
            .history
            .lock()
            .iter()
            .filter(|record| record.user_id == user_id && record.recorded_at >= since)
            .cloned()
            .collect())
    }

    async fn current_usage(&self, user_id: UserId) -> anyhow::Result<Vec<QuotaCheck>> {
        Ok(self.usage(user_id).await?)
    }
}
