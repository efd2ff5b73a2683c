//! Rows and row sources
//!
//! A row is a flat, sorted map. Field names are namespaced: `event.*` for event
//! envelope fields, `attr.*` for normalized attributes and `feature.*` for
//! derived features. Raw text never appears; rows are built from canonical events.

use serde_json::{Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;
use yachaq_core::{GeoResolution, NodeError, Result, TimeWindow};
use yachaq_labels::{AttributeValue, CanonicalEvent, IngestPipeline};
use yachaq_vault::{LocalVault, VaultCaller};

/// One row
pub type Row = BTreeMap<String, Value>;

/// Finite number as a JSON value
pub fn number(value: f64) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| NodeError::validation("non-finite number in plan data"))
}

/// Row view of a canonical event
pub fn event_row(event: &CanonicalEvent) -> Result<Row> {
    let mut row = Row::new();
    row.insert("event.source".into(), Value::from(event.source.as_str()));
    row.insert("event.category".into(), Value::from(event.category.as_str()));
    row.insert("event.record_type".into(), Value::from(event.record_type.as_str()));
    row.insert("event.t_start".into(), Value::from(event.t_start_ms));
    row.insert("event.t_end".into(), Value::from(event.t_end_ms));
    row.insert("event.duration_s".into(), Value::from(event.duration_secs()));
    if let Some(cell) = &event.coarse_geo_cell {
        let region = cell.coarsen(GeoResolution::Region);
        row.insert("event.geo".into(), Value::from(region.as_str()));
    }
    for (key, value) in &event.attributes {
        let value = match value {
            AttributeValue::Number(n) => number(*n)?,
            AttributeValue::Flag(b) => Value::Bool(*b),
            AttributeValue::Code(c) => Value::from(c.as_str()),
        };
        row.insert(format!("attr.{key}"), value);
    }
    if let Some(features) = &event.derived_features {
        let time = &features.time;
        row.insert("feature.hour".into(), Value::from(time.hour));
        row.insert("feature.weekday".into(), Value::from(time.weekday));
        row.insert("feature.time_of_day".into(), Value::from(time.time_of_day.as_str()));
        row.insert("feature.day_type".into(), Value::from(time.day_type.as_str()));
        if let Some(d) = features.duration {
            row.insert("feature.duration".into(), Value::from(d.as_str()));
        }
        if let Some(d) = features.distance {
            row.insert("feature.distance".into(), Value::from(d.as_str()));
        }
        if let Some(c) = &features.cluster_ref {
            row.insert("feature.cluster_ref".into(), Value::from(c.as_str()));
        }
    }
    Ok(row)
}

/// Where SELECT reads rows from
pub trait RowSource: Send + Sync {
    /// Rows of the given record types whose start lies in `window`
    fn select(&self, record_types: &BTreeSet<String>, window: &TimeWindow) -> Result<Vec<Row>>;
}

/// Reads the vault as the query plan VM and normalizes on the fly
pub struct VaultRowSource {
    vault: Arc<LocalVault>,
    pipeline: IngestPipeline,
}

impl VaultRowSource {
    /// Source over `vault` using `pipeline` for normalization
    pub fn new(vault: Arc<LocalVault>, pipeline: IngestPipeline) -> Self {
        Self { vault, pipeline }
    }
}

impl RowSource for VaultRowSource {
    fn select(&self, record_types: &BTreeSet<String>, window: &TimeWindow) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for record_type in record_types {
            for raw_ref in self.vault.list(record_type) {
                let event =
                    match self
                        .pipeline
                        .process_as(&self.vault, &raw_ref, &VaultCaller::QueryPlanVm)
                    {
                        Ok(event) => event,
                        // expired records are simply absent
                        Err(NodeError::TtlExpired { .. }) => continue,
                        Err(e) => {
                            warn!(%raw_ref, error = %e, "record unreadable for plan");
                            return Err(e);
                        }
                    };
                if window.contains(event.t_start_ms) {
                    rows.push(event_row(&event)?);
                }
            }
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for VaultRowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultRowSource").finish_non_exhaustive()
    }
}

/// Fixed rows, for tests and replays
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource {
    rows: Vec<Row>,
}

impl MemoryRowSource {
    /// Source over prepared rows
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Source over canonical events
    pub fn from_events(events: &[CanonicalEvent]) -> Result<Self> {
        Ok(Self::new(
            events.iter().map(event_row).collect::<Result<Vec<_>>>()?,
        ))
    }
}

impl RowSource for MemoryRowSource {
    fn select(&self, record_types: &BTreeSet<String>, window: &TimeWindow) -> Result<Vec<Row>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                row.get("event.record_type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| record_types.contains(t))
            })
            .filter(|row| {
                row.get("event.t_start")
                    .and_then(Value::as_u64)
                    .is_some_and(|t| window.contains(t))
            })
            .cloned()
            .collect())
    }
}
