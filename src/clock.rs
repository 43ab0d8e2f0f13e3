//! Real-time clock sanity check.
//!
//! Boards without a battery-backed RTC boot near the Unix epoch until NTP
//! catches up. Frames taken in that window are still captured and queued;
//! they are only tagged so an operator can renumber them later.

use chrono::{DateTime, Utc};

/// Flags timestamps that predate a fixed sanity epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockGuard {
    epoch: DateTime<Utc>,
}

impl ClockGuard {
    /// Creates a guard for the given sanity epoch.
    #[must_use]
    pub const fn new(epoch: DateTime<Utc>) -> Self {
        Self { epoch }
    }

    /// Returns `true` unless `now` is earlier than the sanity epoch.
    #[must_use]
    pub fn is_clock_sane(&self, now: DateTime<Utc>) -> bool {
        now >= self.epoch
    }

    /// The configured sanity epoch.
    #[must_use]
    pub const fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn guard() -> ClockGuard {
        ClockGuard::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_epoch_adjacent_time_is_insane() {
        let boot = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 42).unwrap();
        assert!(!guard().is_clock_sane(boot));
    }

    #[test]
    fn test_current_time_is_sane() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 18, 30, 0).unwrap();
        assert!(guard().is_clock_sane(now));
    }

    #[test]
    fn test_epoch_itself_is_sane() {
        assert!(guard().is_clock_sane(guard().epoch()));
    }
}
