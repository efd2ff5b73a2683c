//! Derived features
//!
//! The extractor only ever sees canonical events, never raw records, and emits
//! bucketed values. Raw durations, counts and distances stay in the event's
//! attributes; derived features carry buckets and cluster references only.

use crate::event::{AttributeValue, CanonicalEvent};
use serde::{Deserialize, Serialize};
use time::Weekday;
use yachaq_core::geo::has_precise_coordinates;
use yachaq_core::time::datetime;
use yachaq_core::{NodeError, Result};
use yachaq_crypto::sha256_parts;

/// Keys and substrings that must never appear in derived output
pub const FORBIDDEN_FIELD_FRAGMENTS: &[&str] = &[
    "raw",
    "payload",
    "content",
    "text",
    "email",
    "phone",
    "address",
    "name",
    "ssn",
    "password",
    "secret",
    "token",
    "body",
    "message",
    "creditcard",
    "bankaccount",
];

/// Coarse part of the day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    /// 05:00 to 08:00
    EarlyMorning,
    /// 08:00 to 12:00
    Morning,
    /// 12:00 to 17:00
    Afternoon,
    /// 17:00 to 21:00
    Evening,
    /// 21:00 to 05:00
    Night,
}

impl TimeOfDay {
    /// Bucket an hour of day
    pub fn of_hour(hour: u8) -> Self {
        match hour {
            5..=7 => Self::EarlyMorning,
            8..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }

    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EarlyMorning => "early_morning",
            Self::Morning => "morning",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
            Self::Night => "night",
        }
    }
}

/// Weekday or weekend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    /// Monday to Friday
    Weekday,
    /// Saturday and Sunday
    Weekend,
}

impl DayType {
    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekday => "weekday",
            Self::Weekend => "weekend",
        }
    }
}

/// Calendar position of an event start (UTC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBuckets {
    /// 0..=23
    pub hour: u8,
    /// 1 (Monday) ..= 7 (Sunday)
    pub weekday: u8,
    /// ISO week number, 1..=53
    pub iso_week: u8,
    /// 1..=12
    pub month: u8,
    /// 1..=4
    pub quarter: u8,
    /// Part of day
    pub time_of_day: TimeOfDay,
    /// Weekday or weekend
    pub day_type: DayType,
}

impl TimeBuckets {
    /// Buckets for a timestamp
    pub fn of(ts_ms: u64) -> Result<Self> {
        let dt = datetime(ts_ms)?;
        let hour = dt.hour();
        let weekday = dt.weekday().number_from_monday();
        let month = u8::from(dt.month());
        Ok(Self {
            hour,
            weekday,
            iso_week: dt.iso_week(),
            month,
            quarter: (month - 1) / 3 + 1,
            time_of_day: TimeOfDay::of_hour(hour),
            day_type: match dt.weekday() {
                Weekday::Saturday | Weekday::Sunday => DayType::Weekend,
                _ => DayType::Weekday,
            },
        })
    }
}

/// Duration bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationBucket {
    /// Under a minute
    Instant,
    /// 1 to 5 minutes
    VeryShort,
    /// 5 to 15 minutes
    Short,
    /// 15 to 30 minutes
    Medium,
    /// 30 to 60 minutes
    Long,
    /// 1 to 2 hours
    VeryLong,
    /// Over 2 hours
    Extended,
}

impl DurationBucket {
    /// Bucket a duration in seconds
    pub fn of_secs(secs: u64) -> Self {
        match secs {
            0..=59 => Self::Instant,
            60..=299 => Self::VeryShort,
            300..=899 => Self::Short,
            900..=1799 => Self::Medium,
            1800..=3599 => Self::Long,
            3600..=7199 => Self::VeryLong,
            _ => Self::Extended,
        }
    }

    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::VeryShort => "very_short",
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::VeryLong => "very_long",
            Self::Extended => "extended",
        }
    }
}

/// Count bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountBucket {
    /// Exactly one
    Single,
    /// 2 to 5
    Few,
    /// 6 to 10
    Several,
    /// 11 to 50
    Many,
    /// 51 to 100
    VeryMany,
    /// Over 100
    Numerous,
}

impl CountBucket {
    /// Bucket a positive count; zero has no bucket
    pub fn of(count: u64) -> Option<Self> {
        Some(match count {
            0 => return None,
            1 => Self::Single,
            2..=5 => Self::Few,
            6..=10 => Self::Several,
            11..=50 => Self::Many,
            51..=100 => Self::VeryMany,
            _ => Self::Numerous,
        })
    }

    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Few => "few",
            Self::Several => "several",
            Self::Many => "many",
            Self::VeryMany => "very_many",
            Self::Numerous => "numerous",
        }
    }
}

/// Distance bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceBucket {
    /// Under 100 m
    Nearby,
    /// 100 m to 1 km
    Short,
    /// 1 to 5 km
    Medium,
    /// 5 to 20 km
    Long,
    /// 20 to 100 km
    VeryLong,
    /// Over 100 km
    Distant,
}

impl DistanceBucket {
    /// Bucket a distance in meters
    pub fn of_meters(meters: f64) -> Self {
        if meters < 100.0 {
            Self::Nearby
        } else if meters < 1_000.0 {
            Self::Short
        } else if meters < 5_000.0 {
            Self::Medium
        } else if meters < 20_000.0 {
            Self::Long
        } else if meters < 100_000.0 {
            Self::VeryLong
        } else {
            Self::Distant
        }
    }

    /// Label value
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nearby => "nearby",
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
            Self::VeryLong => "very_long",
            Self::Distant => "distant",
        }
    }
}

/// Data quality flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFlags {
    /// Event carries a coarse location
    pub has_geo: bool,
    /// Event spans a non-zero interval
    pub has_duration: bool,
    /// Source is a known first-party connector
    pub verified_source: bool,
    /// All fields expected for the record type are present
    pub complete: bool,
}

/// Bucketed features of one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFeatures {
    /// Calendar buckets of the start time
    pub time: TimeBuckets,
    /// Duration bucket, when the event has a duration
    pub duration: Option<DurationBucket>,
    /// Count bucket, when the event has a count
    pub count: Option<CountBucket>,
    /// Distance bucket, when the event has a distance
    pub distance: Option<DistanceBucket>,
    /// Behavioural cluster reference (`cNN`)
    pub cluster_ref: Option<String>,
    /// Quality flags
    pub quality: QualityFlags,
}

const VERIFIED_SOURCES: &[&str] = &["healthkit", "health_connect", "strava", "google_fit", "garmin"];

/// Computes [`DerivedFeatures`] from canonical events
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    cluster_count: u8,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self { cluster_count: 16 }
    }
}

impl FeatureExtractor {
    /// Extractor assigning events to `cluster_count` clusters (0 disables clustering)
    pub fn new(cluster_count: u8) -> Self {
        Self { cluster_count }
    }

    /// Extract features
    pub fn extract(&self, event: &CanonicalEvent) -> Result<DerivedFeatures> {
        let time = TimeBuckets::of(event.t_start_ms)?;
        let secs = event.duration_secs();
        let duration = (secs > 0).then(|| DurationBucket::of_secs(secs));
        let count = event
            .number("count")
            .and_then(|c| CountBucket::of(c.max(0.0) as u64));
        let distance = event.number("distance_m").map(DistanceBucket::of_meters);

        let features = DerivedFeatures {
            cluster_ref: self.cluster_ref(event, &time, distance),
            quality: QualityFlags {
                has_geo: event.coarse_geo_cell.is_some(),
                has_duration: secs > 0,
                verified_source: VERIFIED_SOURCES.contains(&event.source.as_str()),
                complete: is_complete(event),
            },
            time,
            duration,
            count,
            distance,
        };
        validate_no_leakage(&features)?;
        Ok(features)
    }

    /// Deterministic cluster from record type, part of day, day type and distance
    fn cluster_ref(
        &self,
        event: &CanonicalEvent,
        time: &TimeBuckets,
        distance: Option<DistanceBucket>,
    ) -> Option<String> {
        if self.cluster_count == 0 {
            return None;
        }
        let digest = sha256_parts(&[
            event.record_type.as_bytes(),
            time.time_of_day.as_str().as_bytes(),
            time.day_type.as_str().as_bytes(),
            distance.map(DistanceBucket::as_str).unwrap_or("none").as_bytes(),
        ]);
        let index = digest.as_bytes()[0] % self.cluster_count;
        Some(format!("c{index:02}"))
    }
}

fn is_complete(event: &CanonicalEvent) -> bool {
    let required: &[&str] = match event.record_type.as_str() {
        "trip" => &["distance_m", "mode"],
        "steps" => &["count"],
        "heart_rate" => &["bpm"],
        "sleep" => &["stage"],
        "workout" => &["kind"],
        _ => &[],
    };
    required.iter().all(|k| event.attributes.contains_key(*k))
}

/// Reject features that carry identifying strings.
///
/// Every string in the serialized form must be a bucket name or cluster
/// reference: no forbidden field fragments, no `@`, no precise coordinates.
pub fn validate_no_leakage(features: &DerivedFeatures) -> Result<()> {
    let value = serde_json::to_value(features)?;
    scan_value(&value, "")
}

fn scan_value(value: &serde_json::Value, path: &str) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                let lowered = key.to_ascii_lowercase();
                if let Some(fragment) = FORBIDDEN_FIELD_FRAGMENTS
                    .iter()
                    .find(|f| lowered.contains(*f))
                {
                    return Err(NodeError::validation(format!(
                        "derived field {path}.{key} matches forbidden fragment {fragment}"
                    )));
                }
                scan_value(v, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => items.iter().try_for_each(|v| scan_value(v, path)),
        serde_json::Value::String(s) => check_token(s, path),
        _ => Ok(()),
    }
}

fn check_token(s: &str, path: &str) -> Result<()> {
    let safe = s.len() <= 32
        && !s.contains('@')
        && !has_precise_coordinates(s)
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if safe {
        Ok(())
    } else {
        Err(NodeError::validation(format!(
            "derived field {path} carries a non-bucket value"
        )))
    }
}

/// Check an attribute map for values a normalizer must not emit
pub fn attributes_are_clean(event: &CanonicalEvent) -> bool {
    event.attributes.iter().all(|(key, value)| {
        let lowered = key.to_ascii_lowercase();
        !FORBIDDEN_FIELD_FRAGMENTS.iter().any(|f| lowered.contains(f))
            && match value {
                AttributeValue::Code(code) => check_token(code, key).is_ok(),
                _ => true,
            }
    })
}
