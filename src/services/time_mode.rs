//! DAY/NIGHT derivation from the configured local zone

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::TimeMode;

/// Maps wall-clock instants onto DAY or NIGHT using configured local hours.
#[derive(Debug, Clone)]
pub struct TimeModeService {
    tz: Tz,
    day_start_hour: u32,
    day_end_hour: u32,
}

impl TimeModeService {
    pub fn new(tz: Tz, day_start_hour: u32, day_end_hour: u32) -> Self {
        Self {
            tz,
            day_start_hour,
            day_end_hour,
        }
    }

    /// Mode at a unix timestamp.
    ///
    /// Non-wrap: DAY when `start <= hour < end`. When `start >= end` the day
    /// span wraps midnight: DAY when `hour >= start || hour < end`.
    pub fn mode_at(&self, ts: i64) -> TimeMode {
        let hour = self.local_time(ts).hour();
        let day = if self.day_start_hour < self.day_end_hour {
            hour >= self.day_start_hour && hour < self.day_end_hour
        } else {
            hour >= self.day_start_hour || hour < self.day_end_hour
        };
        if day {
            TimeMode::Day
        } else {
            TimeMode::Night
        }
    }

    pub fn local_time(&self, ts: i64) -> DateTime<Tz> {
        // A unix instant converts unambiguously; the fallback only covers
        // timestamps outside chrono's representable range.
        self.tz
            .timestamp_opt(ts, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap().with_timezone(&self.tz))
    }

    pub fn format_local(&self, ts: i64) -> String {
        self.local_time(ts).format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Zurich;
    use chrono_tz::UTC;

    fn utc_ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp()
    }

    #[test]
    fn day_window_in_utc() {
        let service = TimeModeService::new(UTC, 8, 22);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 7, 59)), TimeMode::Night);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 8, 0)), TimeMode::Day);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 21, 59)), TimeMode::Day);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 22, 0)), TimeMode::Night);
    }

    #[test]
    fn local_zone_shifts_the_boundary() {
        // 06:30 UTC in summer is 08:30 in Zurich (CEST, UTC+2): already day.
        let service = TimeModeService::new(Zurich, 8, 22);
        assert_eq!(service.mode_at(utc_ts(2026, 7, 1, 6, 30)), TimeMode::Day);
        assert_eq!(service.mode_at(utc_ts(2026, 7, 1, 5, 30)), TimeMode::Night);
    }

    #[test]
    fn wrapped_day_span_over_midnight() {
        let service = TimeModeService::new(UTC, 22, 6);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 23, 0)), TimeMode::Day);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 2, 0)), TimeMode::Day);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 6, 0)), TimeMode::Night);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 12, 0)), TimeMode::Night);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 22, 0)), TimeMode::Day);
    }

    #[test]
    fn degenerate_equal_hours_wraps_to_always_day() {
        // start == end wraps: hour >= 8 || hour < 8 covers every hour.
        let service = TimeModeService::new(UTC, 8, 8);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 3, 0)), TimeMode::Day);
        assert_eq!(service.mode_at(utc_ts(2026, 6, 1, 15, 0)), TimeMode::Day);
    }
}
