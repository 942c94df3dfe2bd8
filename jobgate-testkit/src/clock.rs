use chrono::{DateTime, Duration, TimeZone, Utc};
use jobgate::Clock;
use parking_lot::Mutex;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Mid-month, mid-day start so window arithmetic has room either side.
    pub fn fixed() -> Self {
        Self::new(
            Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        )
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::fixed()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
