//! Schema scanner
//!
//! Runs on every publication and as a static check over the serialized field set.
//! Anything it cannot positively recognise as coarse is a violation.

use crate::entry::OdxEntry;
use serde_json::Value;
use std::fmt;
use yachaq_core::geo::has_precise_coordinates;
use yachaq_core::{GeoCell, Result, TimeGranularity};
use yachaq_labels::features::FORBIDDEN_FIELD_FRAGMENTS;
use yachaq_labels::label::is_valid_label;

/// Field names an entry may serialize
pub const ALLOWED_FIELDS: &[&str] = &[
    "facet_key",
    "time_bucket",
    "geo_bucket",
    "time_granularity",
    "geo_resolution",
    "aggregate",
    "count",
    "quality",
    "privacy_floor",
];

/// A single scanner finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Field outside [`ALLOWED_FIELDS`]
    UnknownField(String),
    /// Field or facet containing a forbidden fragment
    ForbiddenFragment {
        /// Where
        location: String,
        /// Matched fragment
        fragment: &'static str,
    },
    /// Facet key not `namespace:value`
    BadFacetKey(String),
    /// Time bucket malformed or inconsistent with its granularity
    BadTimeBucket(String),
    /// Geo bucket malformed, too precise, or inconsistent with its resolution
    BadGeoBucket(String),
    /// Count below the floor
    BelowFloor {
        /// Entry count
        count: u64,
        /// Required floor
        floor: u64,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownField(field) => write!(f, "unknown field {field}"),
            Self::ForbiddenFragment { location, fragment } => {
                write!(f, "{location} contains forbidden fragment {fragment}")
            }
            Self::BadFacetKey(key) => write!(f, "malformed facet key {key}"),
            Self::BadTimeBucket(bucket) => write!(f, "malformed time bucket {bucket}"),
            Self::BadGeoBucket(bucket) => write!(f, "malformed geo bucket {bucket}"),
            Self::BelowFloor { count, floor } => {
                write!(f, "count {count} below privacy floor {floor}")
            }
        }
    }
}

/// Validates entries before they are published
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaScanner;

impl SchemaScanner {
    /// Every violation in `entry`, empty when clean
    pub fn scan(&self, entry: &OdxEntry) -> Result<Vec<Violation>> {
        let mut violations = self.scan_fields(&serde_json::to_value(entry)?);

        let facet = entry.facet_key.to_ascii_lowercase();
        if let Some(fragment) = forbidden_fragment(&facet) {
            violations.push(Violation::ForbiddenFragment {
                location: format!("facet {}", entry.facet_key),
                fragment,
            });
        }
        if !is_valid_label(&entry.facet_key) {
            violations.push(Violation::BadFacetKey(entry.facet_key.clone()));
        }

        if TimeGranularity::of_bucket(&entry.time_bucket) != Some(entry.time_granularity) {
            violations.push(Violation::BadTimeBucket(entry.time_bucket.clone()));
        }

        let geo_ok = !has_precise_coordinates(&entry.geo_bucket)
            && GeoCell::parse(&entry.geo_bucket)
                .map(|cell| cell.resolution() == entry.geo_resolution)
                .unwrap_or(false);
        if !geo_ok {
            violations.push(Violation::BadGeoBucket(entry.geo_bucket.clone()));
        }

        if entry.aggregate.count < entry.privacy_floor {
            violations.push(Violation::BelowFloor {
                count: entry.aggregate.count,
                floor: entry.privacy_floor,
            });
        }
        Ok(violations)
    }

    /// Static field-set check over a serialized entry
    pub fn scan_fields(&self, value: &Value) -> Vec<Violation> {
        let mut violations = Vec::new();
        collect_field_violations(value, &mut violations);
        violations
    }
}

fn collect_field_violations(value: &Value, out: &mut Vec<Violation>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if !ALLOWED_FIELDS.contains(&key.as_str()) {
                    out.push(Violation::UnknownField(key.clone()));
                }
                if let Some(fragment) = forbidden_fragment(&key.to_ascii_lowercase()) {
                    out.push(Violation::ForbiddenFragment {
                        location: format!("field {key}"),
                        fragment,
                    });
                }
                collect_field_violations(v, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_field_violations(v, out)),
        _ => {}
    }
}

fn forbidden_fragment(s: &str) -> Option<&'static str> {
    FORBIDDEN_FIELD_FRAGMENTS
        .iter()
        .copied()
        .find(|fragment| s.contains(fragment))
}
