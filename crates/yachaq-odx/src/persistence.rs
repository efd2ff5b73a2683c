//! Index snapshot on disk
//!
//! The snapshot holds observations and the published entries keyed by
//! `(facet_key, time_bucket, geo_bucket)`. On restore the entries are rebuilt
//! from observations and must match the stored ones.

use crate::builder::{IndexState, IndexedEvent, ObservationCount, ObservationKey, OdxBuilder};
use crate::entry::OdxEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use yachaq_core::config::PrivacyConfig;
use yachaq_core::{AuditSink, NodeError, Result};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    events: Vec<(Uuid, IndexedEvent)>,
    observations: Vec<(ObservationKey, ObservationCount)>,
    entries: Vec<OdxEntry>,
}

impl OdxBuilder {
    /// Write the index to `path`
    pub fn persist(&self, path: &Path) -> Result<()> {
        let state = self.state.read();
        let snapshot = Snapshot {
            format_version: FORMAT_VERSION,
            events: state
                .events
                .iter()
                .map(|(id, indexed)| (*id, indexed.clone()))
                .collect(),
            observations: state
                .observations
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            entries: state.published.values().cloned().collect(),
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), entries = snapshot.entries.len(), "persisted discovery index");
        Ok(())
    }

    /// Load an index written by [`OdxBuilder::persist`]
    pub fn restore(path: &Path, config: PrivacyConfig, audit: Arc<dyn AuditSink>) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_slice(&fs::read(path)?)?;
        if snapshot.format_version != FORMAT_VERSION {
            return Err(NodeError::validation(format!(
                "unsupported index format {}",
                snapshot.format_version
            )));
        }
        let builder = Self::new(config, audit);
        {
            let mut state = builder.state.write();
            *state = IndexState {
                events: snapshot.events.into_iter().collect(),
                observations: snapshot.observations.into_iter().collect(),
                ..IndexState::default()
            };
            let facets: BTreeSet<String> = state
                .observations
                .keys()
                .map(|k| k.facet_key.clone())
                .collect();
            for facet in &facets {
                builder.republish(&mut state, facet)?;
            }
            let rebuilt: Vec<&OdxEntry> = state.published.values().collect();
            let mut stored = snapshot.entries;
            stored.sort_by_key(OdxEntry::key);
            if rebuilt.len() != stored.len() || rebuilt.iter().zip(&stored).any(|(a, b)| *a != b) {
                return Err(NodeError::integrity(
                    "stored index entries do not match their observations",
                ));
            }
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yachaq_audit::AuditLog;
    use yachaq_core::{Effects, GeoCell, RawRef};
    use yachaq_labels::{CanonicalEvent, EventCategory, Label};

    #[test]
    fn test_persist_and_restore() {
        let (effects, _) = Effects::deterministic(31, 0);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        let config = PrivacyConfig {
            k_min: 2,
            high_sensitivity_k_min: 4,
        };
        let odx = OdxBuilder::new(config.clone(), audit.clone());
        for i in 0..3u8 {
            let mut event = CanonicalEvent::new(
                "strava",
                EventCategory::Mobility,
                "trip",
                RawRef::generate(&effects),
                &i.to_string(),
                1_772_447_400_000,
                1_772_447_400_000,
            )
            .unwrap();
            event.coarse_geo_cell = Some(GeoCell::country("PE").unwrap());
            event.labels.insert(Label::parse("mobility:trip").unwrap());
            odx.upsert(&event).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odx.json");
        odx.persist(&path).unwrap();
        let restored = OdxBuilder::restore(&path, config.clone(), audit.clone()).unwrap();
        assert_eq!(restored.entries(), odx.entries());
        assert_eq!(restored.stats(), odx.stats());

        let mut text = fs::read_to_string(&path).unwrap();
        text = text.replace("\"privacy_floor\": 2", "\"privacy_floor\": 1");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            OdxBuilder::restore(&path, config, audit),
            Err(NodeError::IntegrityFailure { .. })
        ));
    }
}
