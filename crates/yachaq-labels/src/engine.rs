//! Rule-based labeling

use crate::event::{CanonicalEvent, EventCategory};
use crate::features::DerivedFeatures;
use crate::label::{Label, LabelSet};
use crate::ontology::LabelOntology;
use std::collections::BTreeSet;
use tracing::trace;
use yachaq_core::{GeoResolution, NodeError, Result};

/// Assigns namespaced labels from canonical attributes and derived features
#[derive(Debug, Clone)]
pub struct LabelEngine {
    ontology: LabelOntology,
    clustering: bool,
}

impl Default for LabelEngine {
    fn default() -> Self {
        Self::new(LabelOntology::current(), false)
    }
}

impl LabelEngine {
    /// Engine emitting labels under `ontology`; `clustering` adds `cluster:` labels
    pub fn new(ontology: LabelOntology, clustering: bool) -> Self {
        Self {
            ontology,
            clustering,
        }
    }

    /// Ontology in use
    pub fn ontology(&self) -> &LabelOntology {
        &self.ontology
    }

    /// Compute labels without touching the event
    pub fn labels_for(
        &self,
        event: &CanonicalEvent,
        features: &DerivedFeatures,
    ) -> Result<LabelSet> {
        let mut names: Vec<String> = vec![format!("category:{}", event.category)];

        let family = match event.category {
            EventCategory::Mobility => "mobility",
            EventCategory::Health | EventCategory::Activity => "health",
        };
        names.push(format!("{family}:{}", event.record_type));

        for (attribute, namespace) in [("mode", "mode"), ("stage", "sleep"), ("kind", "workout")] {
            if let Some(code) = event.code(attribute) {
                names.push(format!("{namespace}:{code}"));
            }
        }

        names.push(format!("time:{}", features.time.time_of_day.as_str()));
        names.push(format!("day:{}", features.time.day_type.as_str()));
        if let Some(bucket) = features.duration {
            names.push(format!("duration:{}", bucket.as_str()));
        }
        if let Some(bucket) = features.distance {
            names.push(format!("distance:{}", bucket.as_str()));
        }
        if let Some(bucket) = features.count {
            names.push(format!("count:{}", bucket.as_str()));
        }
        if let Some(cell) = &event.coarse_geo_cell {
            let country = cell.coarsen(GeoResolution::Country);
            if country.resolution() == GeoResolution::Country {
                names.push(format!("geo:{}", country.as_str().to_ascii_lowercase()));
            }
        }
        if features.quality.verified_source {
            names.push("quality:verified".to_string());
        }
        if features.quality.complete {
            names.push("quality:complete".to_string());
        }
        if self.clustering {
            if let Some(cluster) = &features.cluster_ref {
                names.push(format!("cluster:{cluster}"));
            }
        }

        let mut labels = BTreeSet::new();
        for name in names {
            let label = Label::parse(&name)?;
            if !self.ontology.is_valid(&label) {
                return Err(NodeError::validation(format!(
                    "label {label} is not defined in ontology {}",
                    self.ontology.version()
                )));
            }
            labels.insert(label);
        }
        trace!(event_id = %event.event_id, count = labels.len(), "labeled event");
        Ok(LabelSet {
            event_id: event.event_id,
            ontology_version: self.ontology.version().to_string(),
            labels,
        })
    }

    /// Attach features and labels to the event
    pub fn apply(&self, event: &mut CanonicalEvent, features: DerivedFeatures) -> Result<LabelSet> {
        let set = self.labels_for(event, &features)?;
        event.derived_features = Some(features);
        event.labels = set.labels.clone();
        event.ontology_version = set.ontology_version.clone();
        Ok(set)
    }
}
