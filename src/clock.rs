//! Timestamp precision handling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The unit in which a storage instance interprets all timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPrecision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimestampPrecision {
    /// Converts a wall-clock duration into this precision's integer units,
    /// saturating at `i64::MAX`.
    pub fn units_in(self, duration: Duration) -> i64 {
        let units = match self {
            TimestampPrecision::Nanoseconds => duration.as_nanos(),
            TimestampPrecision::Microseconds => duration.as_micros(),
            TimestampPrecision::Milliseconds => duration.as_millis(),
            TimestampPrecision::Seconds => duration.as_secs() as u128,
        };
        units.min(i64::MAX as u128) as i64
    }

    /// The current Unix time expressed in this precision.
    pub fn now(self) -> i64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.units_in(since_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_in_converts_per_precision() {
        let d = Duration::from_millis(1_500);
        assert_eq!(TimestampPrecision::Seconds.units_in(d), 1);
        assert_eq!(TimestampPrecision::Milliseconds.units_in(d), 1_500);
        assert_eq!(TimestampPrecision::Microseconds.units_in(d), 1_500_000);
        assert_eq!(TimestampPrecision::Nanoseconds.units_in(d), 1_500_000_000);
    }

    #[test]
    fn units_in_saturates_instead_of_overflowing() {
        let huge = Duration::from_secs(u64::MAX);
        assert_eq!(TimestampPrecision::Nanoseconds.units_in(huge), i64::MAX);
    }

    #[test]
    fn now_is_positive_in_every_precision() {
        for precision in [
            TimestampPrecision::Nanoseconds,
            TimestampPrecision::Microseconds,
            TimestampPrecision::Milliseconds,
            TimestampPrecision::Seconds,
        ] {
            assert!(precision.now() > 0);
        }
    }
}
