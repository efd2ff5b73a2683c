//! Normalizers turn raw connector JSON into [`CanonicalEvent`]s.
//!
//! Normalizers are deterministic: the same raw bytes and reference always produce
//! the same event. Unknown fields are dropped; vocabulary fields outside their
//! closed set map to `other`.

mod health;
mod mobility;

pub use health::HealthNormalizer;
pub use mobility::MobilityNormalizer;

use crate::event::CanonicalEvent;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use yachaq_core::{GeoCell, NodeError, RawRef, Result};
use yachaq_crypto::sha256;

/// Provenance handed to a normalizer with the raw JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContext {
    /// Vault reference of the raw record
    pub raw_ref: RawRef,
    /// Connector that produced it
    pub source: String,
    /// Record type from vault metadata
    pub record_type: String,
    /// SHA-256 hex of the raw bytes
    pub content_hash: String,
}

/// Converts one record type family into canonical events
pub trait Normalizer: Send + Sync {
    /// Family name (`"mobility"`, `"health"`)
    fn source(&self) -> &str;

    /// Normalizer version
    fn version(&self) -> &str;

    /// Record types this normalizer accepts
    fn record_types(&self) -> &[&'static str];

    /// Normalize one raw record
    fn normalize(&self, ctx: &RawContext, raw: &Value) -> Result<CanonicalEvent>;
}

/// Record type to normalizer lookup
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    by_record_type: BTreeMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in mobility and health normalizers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MobilityNormalizer));
        registry.register(Arc::new(HealthNormalizer));
        registry
    }

    /// Register a normalizer for all of its record types
    pub fn register(&mut self, normalizer: Arc<dyn Normalizer>) {
        for record_type in normalizer.record_types() {
            self.by_record_type
                .insert((*record_type).to_string(), normalizer.clone());
        }
    }

    /// Normalizer for `record_type`
    pub fn get(&self, record_type: &str) -> Option<&Arc<dyn Normalizer>> {
        self.by_record_type.get(record_type)
    }

    /// Registered record types, sorted
    pub fn record_types(&self) -> Vec<String> {
        self.by_record_type.keys().cloned().collect()
    }

    /// Parse raw bytes as JSON and normalize
    pub fn normalize(
        &self,
        raw_ref: &RawRef,
        source: &str,
        record_type: &str,
        bytes: &[u8],
    ) -> Result<CanonicalEvent> {
        let normalizer = self.get(record_type).ok_or_else(|| {
            NodeError::validation(format!("no normalizer for record type {record_type}"))
        })?;
        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| NodeError::validation(format!("raw record is not JSON: {e}")))?;
        let ctx = RawContext {
            raw_ref: raw_ref.clone(),
            source: source.to_string(),
            record_type: record_type.to_string(),
            content_hash: sha256(bytes).to_hex(),
        };
        normalizer.normalize(&ctx, &raw)
    }
}

impl std::fmt::Debug for NormalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizerRegistry")
            .field("record_types", &self.record_types())
            .finish()
    }
}

pub(crate) fn required_u64(raw: &Value, key: &str) -> Result<u64> {
    raw.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| NodeError::validation(format!("missing or invalid field {key}")))
}

pub(crate) fn optional_f64(raw: &Value, key: &str) -> Result<Option<f64>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| NodeError::validation(format!("field {key} must be a number"))),
    }
}

/// Map a free-form string onto a vocabulary via a synonym table
pub(crate) fn vocab_code(raw: &Value, key: &str, synonyms: &[(&str, &'static str)]) -> &'static str {
    let Some(text) = raw.get(key).and_then(Value::as_str) else {
        return "other";
    };
    let lowered = text.trim().to_ascii_lowercase();
    synonyms
        .iter()
        .find(|(word, _)| *word == lowered)
        .map(|(_, code)| *code)
        .unwrap_or("other")
}

/// Coarse location from `country`, `region`, `lat`, `lon` fields
pub(crate) fn coarse_geo(raw: &Value) -> Result<Option<GeoCell>> {
    let Some(country) = raw.get("country").and_then(Value::as_str) else {
        return Ok(None);
    };
    let region = raw.get("region").and_then(Value::as_str);
    let lat = optional_f64(raw, "lat")?;
    let lon = optional_f64(raw, "lon")?;
    let cell = match (region, lat, lon) {
        (Some(region), Some(lat), Some(lon)) => GeoCell::city(country, region, lat, lon)?,
        (Some(region), _, _) => GeoCell::region(country, region)?,
        _ => GeoCell::country(country)?,
    };
    Ok(Some(cell))
}
