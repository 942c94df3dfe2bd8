//! Usage reporting over quota consumption history.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::JobGateResult;
use crate::job::UserId;
use crate::quota::{QuotaCheck, Resource};

/// One recorded consumption or refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: UserId,
    pub resource: Resource,
    /// Units consumed; negative when units were handed back.
    pub amount: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Read access to the counters behind a quota manager.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn usage_records(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageRecord>>;

    async fn current_usage(&self, user_id: UserId) -> anyhow::Result<Vec<QuotaCheck>>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPeriod {
    Day,
    Week,
    Month,
}

impl ReportPeriod {
    pub fn length(&self) -> Duration {
        match self {
            ReportPeriod::Day => Duration::days(1),
            ReportPeriod::Week => Duration::weeks(1),
            ReportPeriod::Month => Duration::days(30),
        }
    }

    /// How far back any report or trend reads: the longest period plus the
    /// one before it.
    pub fn retention() -> Duration {
        ReportPeriod::Month.length() * 2
    }

    /// Width of a single bucket inside the period.
    pub fn bucket(&self) -> Duration {
        match self {
            ReportPeriod::Day => Duration::hours(1),
            ReportPeriod::Week | ReportPeriod::Month => Duration::days(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub start: DateTime<Utc>,
    pub totals: BTreeMap<Resource, u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub user_id: UserId,
    pub period: ReportPeriod,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub totals: BTreeMap<Resource, u64>,
    pub buckets: Vec<UsageBucket>,
    pub current: Vec<QuotaCheck>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageTrend {
    pub resource: Resource,
    pub current: u64,
    pub previous: u64,
    /// `None` when the previous period had no usage.
    pub change_pct: Option<f64>,
}

pub struct UsageReporter {
    source: Arc<dyn UsageSource>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for UsageReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageReporter").finish_non_exhaustive()
    }
}

impl UsageReporter {
    pub fn new(source: Arc<dyn UsageSource>) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Arc<dyn UsageSource>, clock: Arc<dyn Clock>) -> Self {
        Self { source, clock }
    }

    /// Usage over the trailing `period`, split into buckets.
    pub async fn report(&self, user_id: UserId, period: ReportPeriod) -> JobGateResult<UsageReport> {
        let until = self.clock.now();
        let since = until - period.length();
        let records = self.source.usage_records(user_id, since).await?;
        let current = self.source.current_usage(user_id).await?;

        let width = period.bucket();
        let bucket_count = (period.length().num_seconds() / width.num_seconds()).max(1);
        let mut buckets: Vec<UsageBucket> = (0..bucket_count)
            .map(|i| UsageBucket {
                start: since + width * i as i32,
                totals: BTreeMap::new(),
            })
            .collect();

        let mut totals = BTreeMap::new();
        for record in records.iter().filter(|r| r.recorded_at <= until) {
            apply(&mut totals, record);
            let index = ((record.recorded_at - since).num_seconds() / width.num_seconds())
                .clamp(0, bucket_count - 1) as usize;
            if let Some(bucket) = buckets.get_mut(index) {
                apply(&mut bucket.totals, record);
            }
        }
        totals.retain(|_, amount| *amount > 0);
        for bucket in &mut buckets {
            bucket.totals.retain(|_, amount| *amount > 0);
        }

        Ok(UsageReport {
            user_id,
            period,
            since,
            until,
            totals,
            buckets,
            current,
        })
    }

    /// Compares the trailing period with the one before it.
    pub async fn trends(&self, user_id: UserId, period: ReportPeriod) -> JobGateResult<Vec<UsageTrend>> {
        let now = self.clock.now();
        let boundary = now - period.length();
        let records = self
            .source
            .usage_records(user_id, boundary - period.length())
            .await?;

        let mut current: BTreeMap<Resource, u64> = BTreeMap::new();
        let mut previous: BTreeMap<Resource, u64> = BTreeMap::new();
        for record in records.iter().filter(|r| r.recorded_at <= now) {
            let side = if record.recorded_at >= boundary {
                &mut current
            } else {
                &mut previous
            };
            apply(side, record);
        }
        current.retain(|_, amount| *amount > 0);
        previous.retain(|_, amount| *amount > 0);

        Ok(Resource::ALL
            .into_iter()
            .filter(|resource| current.contains_key(resource) || previous.contains_key(resource))
            .map(|resource| {
                let current = current.get(&resource).copied().unwrap_or(0);
                let previous = previous.get(&resource).copied().unwrap_or(0);
                let change_pct = (previous > 0)
                    .then(|| (current as f64 - previous as f64) / previous as f64 * 100.0);
                UsageTrend {
                    resource,
                    current,
                    previous,
                    change_pct,
                }
            })
            .collect())
    }

    pub fn export_json(report: &UsageReport) -> JobGateResult<String> {
        serde_json::to_string_pretty(report).map_err(|e| anyhow::Error::from(e).into())
    }

    /// One row per non-empty (bucket, resource) cell.
    pub fn export_csv(report: &UsageReport) -> String {
        let mut out = String::from("bucket_start,resource,amount\n");
        for bucket in &report.buckets {
            for (resource, amount) in &bucket.totals {
                let _ = writeln!(out, "{},{},{}", bucket.start.to_rfc3339(), resource, amount);
            }
        }
        out
    }
}

/// Adds a record to a running total; refunds never take it below zero.
fn apply(totals: &mut BTreeMap<Resource, u64>, record: &UsageRecord) {
    let total = totals.entry(record.resource).or_insert(0);
    *total = total.saturating_add_signed(record.amount);
}
