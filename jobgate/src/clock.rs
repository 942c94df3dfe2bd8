use std::fmt::Debug;

use chrono::{DateTime, Utc};

/// Source of wall-clock time. Quota windows, rate-limit windows and orphan
/// timeouts all read time through this so tests can drive it by hand.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Longest configurable span (one leap year). Larger values would push
/// window arithmetic outside chrono's range.
pub const MAX_CONFIG_SECS: u64 = 366 * 24 * 60 * 60;

/// `secs` as a chrono duration, capped at [`MAX_CONFIG_SECS`].
pub fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_CONFIG_SECS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_seconds_caps_extreme_values() {
        assert_eq!(bounded_seconds(60), chrono::Duration::seconds(60));
        assert_eq!(
            bounded_seconds(u64::MAX),
            chrono::Duration::seconds(MAX_CONFIG_SECS as i64)
        );
        let _ = Utc::now() + bounded_seconds(u64::MAX);
    }
}
