//! Incremental index builder with roll-up ladder

use crate::entry::{Aggregate, EntryKey, OdxEntry, Quality};
use crate::scanner::SchemaScanner;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use yachaq_core::config::PrivacyConfig;
use yachaq_core::time::MS_PER_DAY;
use yachaq_core::{
    AuditEventType, AuditRecord, AuditSink, GeoCell, GeoResolution, RawRef, Result,
    TimeGranularity, TimeWindow,
};
use yachaq_labels::CanonicalEvent;

/// Roll-up ladder, finest first
pub const LADDER: &[(TimeGranularity, GeoResolution)] = &[
    (TimeGranularity::Day, GeoResolution::City),
    (TimeGranularity::Week, GeoResolution::Region),
    (TimeGranularity::Month, GeoResolution::Country),
    (TimeGranularity::Year, GeoResolution::Country),
    (TimeGranularity::Year, GeoResolution::Global),
];

/// Facet namespaces published under the high-sensitivity floor
pub const SENSITIVE_NAMESPACES: &[&str] = &["health", "sleep"];

/// Fine-grained observation cell `(facet, day, city)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct ObservationKey {
    pub(crate) facet_key: String,
    pub(crate) day_start_ms: u64,
    pub(crate) cell: GeoCell,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ObservationCount {
    pub(crate) count: u64,
    pub(crate) verified: u64,
}

/// Cells one indexed event contributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexedEvent {
    pub(crate) raw_ref: RawRef,
    pub(crate) cells: Vec<ObservationKey>,
    pub(crate) verified: bool,
}

/// Published vs suppressed observations of one facet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    /// Observations inside entries that meet the floor
    pub published: u64,
    /// Observations withheld
    pub suppressed: u64,
}

impl Cohort {
    /// All observations
    pub fn total(&self) -> u64 {
        self.published + self.suppressed
    }
}

/// Outcome of one upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Observations recorded; facets republished
    Recorded {
        /// Facets touched
        facets: usize,
    },
    /// Event id already indexed
    Duplicate,
}

/// Query filter over published entries
#[derive(Debug, Clone, Default)]
pub struct OdxCriteria {
    /// Exact facet key
    pub facet_key: Option<String>,
    /// Facet namespace
    pub namespace: Option<String>,
    /// Entries whose bucket overlaps this window
    pub window: Option<TimeWindow>,
    /// Entries inside this area
    pub within: Option<GeoCell>,
    /// Minimum count
    pub min_count: Option<u64>,
    /// Minimum quality
    pub min_quality: Option<Quality>,
}

impl OdxCriteria {
    fn matches(&self, entry: &OdxEntry) -> bool {
        if self.facet_key.as_deref().is_some_and(|f| f != entry.facet_key) {
            return false;
        }
        if self.namespace.as_deref().is_some_and(|ns| ns != entry.namespace()) {
            return false;
        }
        if self.window.is_some_and(|w| !w.overlaps_bucket(&entry.time_bucket)) {
            return false;
        }
        if let Some(area) = &self.within {
            let inside = GeoCell::parse(&entry.geo_bucket)
                .map(|cell| cell.within(area))
                .unwrap_or(false);
            if !inside {
                return false;
            }
        }
        if self.min_count.is_some_and(|min| entry.count() < min) {
            return false;
        }
        self.min_quality.map_or(true, |q| entry.quality >= q)
    }
}

/// Index statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OdxStats {
    /// Events indexed
    pub events: u64,
    /// Distinct facets observed
    pub facets: u64,
    /// Published entries
    pub entries: u64,
    /// Observations withheld across all facets
    pub suppressed: u64,
    /// Entries refused by the schema scanner
    pub violations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct IndexState {
    pub(crate) events: BTreeMap<Uuid, IndexedEvent>,
    pub(crate) observations: BTreeMap<ObservationKey, ObservationCount>,
    pub(crate) published: BTreeMap<EntryKey, OdxEntry>,
    pub(crate) cohorts: BTreeMap<String, Cohort>,
    pub(crate) violations: u64,
}

/// The on-device discovery index.
///
/// Observations are kept per `(facet, day, city)`. Publishing walks [`LADDER`]:
/// groups meeting the floor become entries, the remainder rolls up to the next
/// rung, and whatever is left after the last rung is suppressed.
pub struct OdxBuilder {
    pub(crate) state: RwLock<IndexState>,
    pub(crate) config: PrivacyConfig,
    scanner: SchemaScanner,
    audit: Arc<dyn AuditSink>,
}

impl OdxBuilder {
    /// Empty index
    pub fn new(config: PrivacyConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            config,
            scanner: SchemaScanner,
            audit,
        }
    }

    /// Floor applied to a facet
    pub fn floor_for(&self, facet_key: &str) -> u64 {
        let namespace = facet_key.split_once(':').map(|(ns, _)| ns).unwrap_or_default();
        if SENSITIVE_NAMESPACES.contains(&namespace) {
            self.config.k_min.max(self.config.high_sensitivity_k_min)
        } else {
            self.config.k_min
        }
    }

    /// Record one observation per label and republish the touched facets
    pub fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome> {
        let mut state = self.state.write();
        if state.events.contains_key(&event.event_id) {
            return Ok(UpsertOutcome::Duplicate);
        }
        let day_start_ms = event.t_start_ms - event.t_start_ms % MS_PER_DAY;
        let cell = event.coarse_geo_cell.clone().unwrap_or_else(GeoCell::global);
        let verified = event
            .derived_features
            .as_ref()
            .is_some_and(|f| f.quality.verified_source && f.quality.complete);

        let mut facets = Vec::with_capacity(event.labels.len());
        let mut cells = Vec::with_capacity(event.labels.len());
        for label in &event.labels {
            let key = ObservationKey {
                facet_key: label.as_str().to_string(),
                day_start_ms,
                cell: cell.clone(),
            };
            let slot = state.observations.entry(key.clone()).or_default();
            slot.count += 1;
            slot.verified += u64::from(verified);
            facets.push(label.as_str().to_string());
            cells.push(key);
        }
        state.events.insert(
            event.event_id,
            IndexedEvent {
                raw_ref: event.raw_ref.clone(),
                cells,
                verified,
            },
        );
        for facet in &facets {
            self.republish(&mut state, facet)?;
        }
        Ok(UpsertOutcome::Recorded {
            facets: facets.len(),
        })
    }

    /// Withdraw every observation derived from `raw_ref` and republish the
    /// facets it touched; returns how many events were dropped
    pub fn retract(&self, raw_ref: &RawRef) -> Result<usize> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let ids: Vec<Uuid> = state
            .events
            .iter()
            .filter(|(_, indexed)| &indexed.raw_ref == raw_ref)
            .map(|(id, _)| *id)
            .collect();

        let mut facets = BTreeSet::new();
        for id in &ids {
            let Some(indexed) = state.events.remove(id) else {
                continue;
            };
            for key in indexed.cells {
                let emptied = match state.observations.get_mut(&key) {
                    Some(slot) => {
                        slot.count = slot.count.saturating_sub(1);
                        slot.verified = slot.verified.saturating_sub(u64::from(indexed.verified));
                        slot.count == 0
                    }
                    None => false,
                };
                if emptied {
                    state.observations.remove(&key);
                }
                facets.insert(key.facet_key);
            }
        }
        for facet in &facets {
            if state.observations.keys().any(|k| &k.facet_key == facet) {
                self.republish(state, facet)?;
            } else {
                state.published.retain(|key, _| &key.facet_key != facet);
                state.cohorts.remove(facet);
            }
        }
        if !ids.is_empty() {
            debug!(%raw_ref, events = ids.len(), facets = facets.len(), "retracted observations");
        }
        Ok(ids.len())
    }

    pub(crate) fn republish(&self, state: &mut IndexState, facet_key: &str) -> Result<()> {
        let floor = self.floor_for(facet_key);
        state.published.retain(|key, _| key.facet_key != facet_key);

        let mut residual: Vec<(u64, GeoCell, ObservationCount)> = state
            .observations
            .iter()
            .filter(|(key, _)| key.facet_key == facet_key)
            .map(|(key, count)| (key.day_start_ms, key.cell.clone(), *count))
            .collect();

        let mut published = 0;
        for (granularity, resolution) in LADDER {
            let mut groups: BTreeMap<(String, GeoCell), (Vec<usize>, ObservationCount)> =
                BTreeMap::new();
            for (index, (day, cell, count)) in residual.iter().enumerate() {
                let group = groups
                    .entry((granularity.bucket(*day)?, cell.coarsen(*resolution)))
                    .or_default();
                group.0.push(index);
                group.1.count += count.count;
                group.1.verified += count.verified;
            }

            let mut consumed = BTreeSet::new();
            for ((time_bucket, geo), (members, total)) in groups {
                if total.count < floor {
                    continue;
                }
                let entry = OdxEntry {
                    facet_key: facet_key.to_string(),
                    time_bucket,
                    geo_resolution: geo.resolution(),
                    geo_bucket: geo.as_str().to_string(),
                    time_granularity: *granularity,
                    aggregate: Aggregate { count: total.count },
                    quality: Quality::from_counts(total.verified, total.count),
                    privacy_floor: floor,
                };
                let violations = self.scanner.scan(&entry)?;
                if !violations.is_empty() {
                    state.violations += 1;
                    let detail = violations
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    warn!(facet = facet_key, %detail, "schema scanner refused entry");
                    self.audit.append(
                        AuditRecord::new(AuditEventType::SchemaViolation)
                            .with("facet_key", facet_key)
                            .with("violations", detail),
                    )?;
                    continue;
                }
                published += total.count;
                consumed.extend(members);
                state.published.insert(entry.key(), entry);
            }
            residual = residual
                .into_iter()
                .enumerate()
                .filter(|(index, _)| !consumed.contains(index))
                .map(|(_, cell)| cell)
                .collect();
        }

        let suppressed: u64 = residual.iter().map(|(_, _, c)| c.count).sum();
        debug!(facet = facet_key, published, suppressed, "republished facet");
        state.cohorts.insert(
            facet_key.to_string(),
            Cohort {
                published,
                suppressed,
            },
        );
        Ok(())
    }

    /// Published entries matching `criteria`, in key order
    pub fn query(&self, criteria: &OdxCriteria) -> Vec<OdxEntry> {
        self.state
            .read()
            .published
            .values()
            .filter(|e| criteria.matches(e))
            .cloned()
            .collect()
    }

    /// Sum of published counts for `facet_key` over entries meeting `floor`
    /// inside `window` (all time when `None`)
    pub fn facet_count(&self, facet_key: &str, floor: u64, window: Option<&TimeWindow>) -> u64 {
        self.state
            .read()
            .published
            .values()
            .filter(|e| e.facet_key == facet_key && e.count() >= floor)
            .filter(|e| window.map_or(true, |w| w.overlaps_bucket(&e.time_bucket)))
            .map(OdxEntry::count)
            .sum()
    }

    /// Published and suppressed observations of a facet under `floor`
    pub fn cohort(&self, facet_key: &str, floor: u64) -> Cohort {
        let state = self.state.read();
        let base = state.cohorts.get(facet_key).copied().unwrap_or_default();
        let published: u64 = state
            .published
            .values()
            .filter(|e| e.facet_key == facet_key && e.count() >= floor)
            .map(OdxEntry::count)
            .sum();
        Cohort {
            published,
            suppressed: base.total() - published,
        }
    }

    /// Whether any entry for `facet_key` is published
    pub fn is_published(&self, facet_key: &str) -> bool {
        self.state
            .read()
            .published
            .keys()
            .any(|k| k.facet_key == facet_key)
    }

    /// All published entries
    pub fn entries(&self) -> Vec<OdxEntry> {
        self.state.read().published.values().cloned().collect()
    }

    /// Statistics
    pub fn stats(&self) -> OdxStats {
        let state = self.state.read();
        OdxStats {
            events: state.events.len() as u64,
            facets: state.cohorts.len() as u64,
            entries: state.published.len() as u64,
            suppressed: state.cohorts.values().map(|c| c.suppressed).sum(),
            violations: state.violations,
        }
    }
}

impl std::fmt::Debug for OdxBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdxBuilder")
            .field("k_min", &self.config.k_min)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeSet;
    use yachaq_audit::AuditLog;
    use yachaq_core::{Effects, RawRef};
    use yachaq_labels::{EventCategory, Label};

    // 2026-03-02T10:30:00Z
    const T0: u64 = 1_772_447_400_000;

    fn builder(k_min: u64) -> OdxBuilder {
        let (effects, _) = Effects::deterministic(21, T0);
        let config = PrivacyConfig {
            k_min,
            high_sensitivity_k_min: k_min * 2,
        };
        OdxBuilder::new(config, Arc::new(AuditLog::in_memory(effects)))
    }

    fn event(seed: u64, ts: u64, cell: &str, labels: &[&str]) -> CanonicalEvent {
        let (effects, _) = Effects::deterministic(seed, 0);
        let mut event = CanonicalEvent::new(
            "strava",
            EventCategory::Mobility,
            "trip",
            RawRef::generate(&effects),
            &format!("{seed}"),
            ts,
            ts,
        )
        .unwrap();
        event.coarse_geo_cell = Some(GeoCell::parse(cell).unwrap());
        event.labels = labels
            .iter()
            .map(|l| Label::parse(l).unwrap())
            .collect::<BTreeSet<_>>();
        event
    }

    #[test]
    fn test_small_cohort_suppressed() {
        let odx = builder(5);
        for i in 0..4 {
            odx.upsert(&event(i, T0, "PE:LIM:-12.0,-77.0", &["mobility:trip"]))
                .unwrap();
        }
        assert!(odx.entries().is_empty());
        let cohort = odx.cohort("mobility:trip", 5);
        assert_eq!(cohort.published, 0);
        assert_eq!(cohort.suppressed, 4);
    }

    #[test]
    fn test_day_city_publishes_at_floor() {
        let odx = builder(3);
        for i in 0..3 {
            odx.upsert(&event(i, T0 + i, "PE:LIM:-12.0,-77.0", &["mobility:trip"]))
                .unwrap();
        }
        let entries = odx.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].time_bucket, "2026-03-02");
        assert_eq!(entries[0].geo_bucket, "PE:LIM:-12.0,-77.0");
        assert_eq!(entries[0].count(), 3);
    }

    #[test]
    fn test_rolls_up_to_week_region() {
        let odx = builder(4);
        // two cells, two days, each below floor; same ISO week and region
        for i in 0..2 {
            odx.upsert(&event(i, T0, "PE:LIM:-12.0,-77.0", &["mobility:trip"]))
                .unwrap();
        }
        for i in 2..4 {
            odx.upsert(&event(i, T0 + MS_PER_DAY, "PE:LIM:-12.1,-77.0", &["mobility:trip"]))
                .unwrap();
        }
        let entries = odx.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].time_bucket, "2026-W10");
        assert_eq!(entries[0].geo_bucket, "PE:LIM");
        assert_eq!(entries[0].time_granularity, TimeGranularity::Week);
    }

    #[test]
    fn test_duplicate_event_ignored() {
        let odx = builder(1);
        let e = event(1, T0, "PE", &["mobility:trip"]);
        assert_eq!(odx.upsert(&e).unwrap(), UpsertOutcome::Recorded { facets: 1 });
        assert_eq!(odx.upsert(&e).unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(odx.facet_count("mobility:trip", 1, None), 1);
    }

    #[test]
    fn test_retract_withdraws_observations() {
        let odx = builder(3);
        let events: Vec<_> = (0..3)
            .map(|i| event(i, T0 + i, "PE:LIM:-12.0,-77.0", &["mobility:trip", "mode:cycle"]))
            .collect();
        for e in &events {
            odx.upsert(e).unwrap();
        }
        assert_eq!(odx.facet_count("mobility:trip", 3, None), 3);

        assert_eq!(odx.retract(&events[0].raw_ref).unwrap(), 1);
        assert!(odx.entries().is_empty());
        let cohort = odx.cohort("mobility:trip", 3);
        assert_eq!((cohort.published, cohort.suppressed), (0, 2));
        assert_eq!(odx.stats().events, 2);
        assert_eq!(odx.retract(&events[0].raw_ref).unwrap(), 0);

        for e in &events[1..] {
            odx.retract(&e.raw_ref).unwrap();
        }
        let stats = odx.stats();
        assert_eq!((stats.events, stats.facets, stats.suppressed), (0, 0, 0));
        assert!(odx.state.read().observations.is_empty());

        // a retracted event can be indexed again
        assert_matches!(odx.upsert(&events[0]), Ok(UpsertOutcome::Recorded { facets: 2 }));
    }

    #[test]
    fn test_sensitive_namespace_uses_higher_floor() {
        let odx = builder(2);
        assert_eq!(odx.floor_for("mobility:trip"), 2);
        assert_eq!(odx.floor_for("health:steps"), 4);
    }

    #[test]
    fn test_query_and_facet_count() {
        let odx = builder(2);
        for i in 0..3 {
            odx.upsert(&event(i, T0, "PE:LIM", &["mobility:trip", "mode:cycle"]))
                .unwrap();
        }
        let criteria = OdxCriteria {
            namespace: Some("mode".into()),
            within: Some(GeoCell::country("PE").unwrap()),
            ..OdxCriteria::default()
        };
        let found = odx.query(&criteria);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].facet_key, "mode:cycle");

        let window = TimeWindow::new(T0 - MS_PER_DAY, T0 + MS_PER_DAY).unwrap();
        assert_eq!(odx.facet_count("mobility:trip", 2, Some(&window)), 3);
        assert_eq!(odx.facet_count("mobility:trip", 4, Some(&window)), 0);
        let later = TimeWindow::new(T0 + 30 * MS_PER_DAY, T0 + 31 * MS_PER_DAY).unwrap();
        assert_eq!(odx.facet_count("mobility:trip", 2, Some(&later)), 0);
        assert_eq!(odx.stats().events, 3);
    }
}
