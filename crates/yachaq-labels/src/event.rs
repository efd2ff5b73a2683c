//! Canonical events
//!
//! Every raw record is normalized into a [`CanonicalEvent`] before anything else
//! looks at it. Attributes are restricted to numbers, flags and closed-vocabulary
//! codes, so free text and media never leave the normalizer.

use crate::features::DerivedFeatures;
use crate::label::Label;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;
use yachaq_core::{GeoCell, NodeError, RawRef, Result};

/// Schema version of canonical events produced by this crate
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Namespace for deterministic event ids
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x79, 0x61, 0x63, 0x68, 0x61, 0x71, 0x2d, 0x65, 0x76, 0x65, 0x6e, 0x74, 0x2d, 0x69, 0x64, 0x31,
]);

/// Broad category of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Trips, visits and other movement
    Mobility,
    /// Health metrics (steps, heart rate, sleep)
    Health,
    /// Exercise sessions
    Activity,
}

impl EventCategory {
    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobility => "mobility",
            Self::Health => "health",
            Self::Activity => "activity",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permitted attribute values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Finite number
    Number(f64),
    /// Boolean flag
    Flag(bool),
    /// Code from a closed vocabulary
    Code(String),
}

impl AttributeValue {
    /// Number if finite, else a validation error
    pub fn number(value: f64) -> Result<Self> {
        if value.is_finite() {
            Ok(Self::Number(value))
        } else {
            Err(NodeError::validation("attribute must be a finite number"))
        }
    }

    /// Code, checked against its vocabulary
    pub fn code(value: &str, vocabulary: &[&str]) -> Result<Self> {
        if vocabulary.contains(&value) {
            Ok(Self::Code(value.to_string()))
        } else {
            Err(NodeError::validation(format!("code {value} is not in vocabulary")))
        }
    }

    /// Numeric view
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Code view
    pub fn as_code(&self) -> Option<&str> {
        match self {
            Self::Code(c) => Some(c),
            _ => None,
        }
    }
}

/// Normalized, labeled view of one raw record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Deterministic id (UUIDv5)
    pub event_id: Uuid,
    /// Connector that produced the raw record
    pub source: String,
    /// Broad category
    pub category: EventCategory,
    /// Record type (`trip`, `steps`, ...)
    pub record_type: String,
    /// Start time in milliseconds
    pub t_start_ms: u64,
    /// End time in milliseconds (equal to start for instants)
    pub t_end_ms: u64,
    /// City-grid or coarser location
    pub coarse_geo_cell: Option<GeoCell>,
    /// Numeric, flag and code attributes
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Features computed by the extractor
    pub derived_features: Option<DerivedFeatures>,
    /// Namespaced labels
    pub labels: BTreeSet<Label>,
    /// Back-reference to the vault object
    pub raw_ref: RawRef,
    /// Canonical schema version
    pub schema_version: String,
    /// Ontology version of `labels`
    pub ontology_version: String,
}

impl CanonicalEvent {
    /// Unlabeled event with a deterministic id
    pub fn new(
        source: &str,
        category: EventCategory,
        record_type: &str,
        raw_ref: RawRef,
        content_hash: &str,
        t_start_ms: u64,
        t_end_ms: u64,
    ) -> Result<Self> {
        if t_end_ms < t_start_ms {
            return Err(NodeError::validation("event ends before it starts"));
        }
        Ok(Self {
            event_id: event_id(source, &raw_ref, content_hash),
            source: source.to_string(),
            category,
            record_type: record_type.to_string(),
            t_start_ms,
            t_end_ms,
            coarse_geo_cell: None,
            attributes: BTreeMap::new(),
            derived_features: None,
            labels: BTreeSet::new(),
            raw_ref,
            schema_version: SCHEMA_VERSION.to_string(),
            ontology_version: String::new(),
        })
    }

    /// Duration in whole seconds
    pub fn duration_secs(&self) -> u64 {
        (self.t_end_ms - self.t_start_ms) / 1000
    }

    /// Attach an attribute
    pub fn set(&mut self, key: &str, value: AttributeValue) {
        self.attributes.insert(key.to_string(), value);
    }

    /// Numeric attribute
    pub fn number(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(AttributeValue::as_f64)
    }

    /// Code attribute
    pub fn code(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_code)
    }

    /// Whether the event carries `label`
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.as_str() == label)
    }
}

/// UUIDv5 over source, raw reference, content hash and schema version
pub fn event_id(source: &str, raw_ref: &RawRef, content_hash: &str) -> Uuid {
    let name = format!("{source}|{raw_ref}|{content_hash}|{SCHEMA_VERSION}");
    Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yachaq_core::Effects;

    #[test]
    fn test_event_id_is_deterministic() {
        let (effects, _) = Effects::deterministic(1, 0);
        let raw_ref = RawRef::generate(&effects);
        let a = event_id("strava", &raw_ref, "abc");
        let b = event_id("strava", &raw_ref, "abc");
        let c = event_id("strava", &raw_ref, "abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_attribute_constructors() {
        assert!(AttributeValue::number(f64::NAN).is_err());
        assert!(AttributeValue::code("walk", &["walk", "run"]).is_ok());
        assert!(AttributeValue::code("teleport", &["walk", "run"]).is_err());
    }

    #[test]
    fn test_inverted_times_rejected() {
        let (effects, _) = Effects::deterministic(2, 0);
        let raw_ref = RawRef::generate(&effects);
        assert!(CanonicalEvent::new(
            "strava",
            EventCategory::Mobility,
            "trip",
            raw_ref,
            "h",
            10,
            5
        )
        .is_err());
    }
}
