//! Calendar bucketing for timestamps
//!
//! All buckets are computed in UTC so that the same timestamp always lands in the
//! same bucket regardless of device locale.

use crate::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Milliseconds per second
pub const MS_PER_SEC: u64 = 1_000;
/// Milliseconds per day
pub const MS_PER_DAY: u64 = 86_400_000;

/// Granularity of a calendar bucket, finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-Www` (ISO week)
    Week,
    /// `YYYY-MM`
    Month,
    /// `YYYY`
    Year,
}

impl TimeGranularity {
    /// Format a timestamp at this granularity
    pub fn bucket(self, ts_ms: u64) -> Result<String> {
        let dt = datetime(ts_ms)?;
        Ok(match self {
            Self::Day => format!(
                "{:04}-{:02}-{:02}",
                dt.year(),
                u8::from(dt.month()),
                dt.day()
            ),
            Self::Week => {
                let (year, week, _) = dt.to_iso_week_date();
                format!("{year:04}-W{week:02}")
            }
            Self::Month => format!("{:04}-{:02}", dt.year(), u8::from(dt.month())),
            Self::Year => format!("{:04}", dt.year()),
        })
    }

    /// Detect the granularity of a formatted bucket string
    pub fn of_bucket(bucket: &str) -> Option<Self> {
        let bytes = bucket.as_bytes();
        let digits = |range: std::ops::Range<usize>| {
            bytes
                .get(range)
                .map(|s| s.iter().all(u8::is_ascii_digit))
                .unwrap_or(false)
        };
        match bytes.len() {
            4 if digits(0..4) => Some(Self::Year),
            7 if digits(0..4) && bytes[4] == b'-' && digits(5..7) => Some(Self::Month),
            8 if digits(0..4) && &bytes[4..6] == b"-W" && digits(6..8) => Some(Self::Week),
            10 if digits(0..4)
                && bytes[4] == b'-'
                && digits(5..7)
                && bytes[7] == b'-'
                && digits(8..10) =>
            {
                Some(Self::Day)
            }
            _ => None,
        }
    }
}

/// Convert milliseconds since epoch into a UTC datetime
pub fn datetime(ts_ms: u64) -> Result<OffsetDateTime> {
    let secs = i64::try_from(ts_ms / MS_PER_SEC)
        .map_err(|_| NodeError::validation(format!("timestamp out of range: {ts_ms}")))?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| NodeError::validation(format!("timestamp out of range: {e}")))
}

/// Half-open time window `[start_ms, end_ms)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start
    pub start_ms: u64,
    /// Exclusive end
    pub end_ms: u64,
}

impl TimeWindow {
    /// Create a window, rejecting inverted bounds
    pub fn new(start_ms: u64, end_ms: u64) -> Result<Self> {
        if end_ms <= start_ms {
            return Err(NodeError::validation(format!(
                "time window end {end_ms} must be after start {start_ms}"
            )));
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Whether `ts_ms` falls inside the window
    pub fn contains(&self, ts_ms: u64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }

    /// Whether `other` lies entirely inside this window
    pub fn covers(&self, other: &TimeWindow) -> bool {
        other.start_ms >= self.start_ms && other.end_ms <= self.end_ms
    }

    /// Whether any bucket string overlaps the window at its granularity
    pub fn overlaps_bucket(&self, bucket: &str) -> bool {
        let Some(granularity) = TimeGranularity::of_bucket(bucket) else {
            return false;
        };
        let (Ok(first), Ok(last)) = (
            granularity.bucket(self.start_ms),
            granularity.bucket(self.end_ms.saturating_sub(1)),
        ) else {
            return false;
        };
        // Buckets of one granularity sort lexicographically in time order.
        bucket >= first.as_str() && bucket <= last.as_str()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-03-02T10:30:00Z, a Monday
    const TS: u64 = 1_772_447_400_000;

    #[test]
    fn test_bucket_formats() {
        assert_eq!(TimeGranularity::Day.bucket(TS).unwrap(), "2026-03-02");
        assert_eq!(TimeGranularity::Week.bucket(TS).unwrap(), "2026-W10");
        assert_eq!(TimeGranularity::Month.bucket(TS).unwrap(), "2026-03");
        assert_eq!(TimeGranularity::Year.bucket(TS).unwrap(), "2026");
    }

    #[test]
    fn test_granularity_detection() {
        assert_eq!(TimeGranularity::of_bucket("2026-03-02"), Some(TimeGranularity::Day));
        assert_eq!(TimeGranularity::of_bucket("2026-W10"), Some(TimeGranularity::Week));
        assert_eq!(TimeGranularity::of_bucket("2026-03"), Some(TimeGranularity::Month));
        assert_eq!(TimeGranularity::of_bucket("2026"), Some(TimeGranularity::Year));
        assert_eq!(TimeGranularity::of_bucket("2026-3-2"), None);
        assert_eq!(TimeGranularity::of_bucket("yesterday"), None);
    }

    #[test]
    fn test_window_overlap() {
        let window = TimeWindow::new(TS, TS + 7 * MS_PER_DAY).unwrap();
        assert!(window.overlaps_bucket("2026-03-05"));
        assert!(window.overlaps_bucket("2026-W10"));
        assert!(window.overlaps_bucket("2026"));
        assert!(!window.overlaps_bucket("2026-02-27"));
        assert!(!window.overlaps_bucket("2025"));
    }

    #[test]
    fn test_inverted_window_rejected() {
        assert!(TimeWindow::new(10, 10).is_err());
    }
}
