//! Published index entries

use serde::{Deserialize, Serialize};
use std::fmt;
use yachaq_core::{GeoResolution, TimeGranularity};

/// Aggregate carried by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Number of observations behind the entry
    pub count: u64,
}

/// Share of observations from verified, complete sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Under half verified
    Low,
    /// At least half verified
    Medium,
    /// At least 80% verified
    High,
}

impl Quality {
    /// Quality from verified and total counts
    pub fn from_counts(verified: u64, total: u64) -> Self {
        if total == 0 {
            return Self::Low;
        }
        let share = verified as f64 / total as f64;
        if share >= 0.8 {
            Self::High
        } else if share >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Composite store key `(facet_key, time_bucket, geo_bucket)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    /// Facet
    pub facet_key: String,
    /// Time bucket string
    pub time_bucket: String,
    /// Geo cell string
    pub geo_bucket: String,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.facet_key, self.time_bucket, self.geo_bucket)
    }
}

/// One published, privacy-floor-respecting index entry.
///
/// No field refers back to an event or raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OdxEntry {
    /// `namespace:value` facet
    pub facet_key: String,
    /// Day, week, month or year bucket
    pub time_bucket: String,
    /// Coarse geo cell
    pub geo_bucket: String,
    /// Granularity of `time_bucket`
    pub time_granularity: TimeGranularity,
    /// Resolution of `geo_bucket`
    pub geo_resolution: GeoResolution,
    /// Aggregate
    pub aggregate: Aggregate,
    /// Source quality
    pub quality: Quality,
    /// Floor the entry was published under
    pub privacy_floor: u64,
}

impl OdxEntry {
    /// Composite key
    pub fn key(&self) -> EntryKey {
        EntryKey {
            facet_key: self.facet_key.clone(),
            time_bucket: self.time_bucket.clone(),
            geo_bucket: self.geo_bucket.clone(),
        }
    }

    /// Observation count
    pub fn count(&self) -> u64 {
        self.aggregate.count
    }

    /// Facet namespace
    pub fn namespace(&self) -> &str {
        self.facet_key
            .split_once(':')
            .map(|(ns, _)| ns)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(Quality::from_counts(0, 0), Quality::Low);
        assert_eq!(Quality::from_counts(4, 5), Quality::High);
        assert_eq!(Quality::from_counts(1, 2), Quality::Medium);
        assert_eq!(Quality::from_counts(1, 3), Quality::Low);
    }
}
