//! Versioned label ontology and migrations
//!
//! Two versions exist: `1.0.0` (current) and `0.9.0` (legacy). Migration tables
//! rename labels between versions; labels with no counterpart in the target
//! version are dropped.

use crate::label::{Label, LabelSet};
use std::collections::BTreeSet;
use tracing::debug;
use yachaq_core::{NodeError, Result};

/// Current ontology version
pub const CURRENT_VERSION: &str = "1.0.0";

/// Legacy ontology version
pub const LEGACY_VERSION: &str = "0.9.0";

const NAMESPACES_1_0: &[&str] = &[
    "category", "mobility", "health", "mode", "time", "day", "duration", "distance", "count",
    "geo", "quality", "sleep", "workout", "cluster",
];

const NAMESPACES_0_9: &[&str] = &[
    "category", "travel", "fitness", "health", "mode", "time", "day", "duration", "distance",
    "count", "geo", "quality", "sleep", "workout",
];

/// Labels that exist under one version only
const RETIRED_IN_1_0: &[&str] = &["time:late_night"];
const ABSENT_IN_0_9: &[&str] = &["time:night", "health:steps", "health:workout"];

/// Legacy label, current label
const RENAMES_0_9_TO_1_0: &[(&str, &str)] = &[
    ("travel:trip", "mobility:trip"),
    ("travel:visit", "mobility:visit"),
    ("fitness:steps", "health:steps"),
    ("fitness:workout", "health:workout"),
    ("time:late_night", "time:night"),
];

/// One ontology version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelOntology {
    version: &'static str,
    namespaces: BTreeSet<&'static str>,
    excluded: BTreeSet<&'static str>,
}

impl LabelOntology {
    /// The current ontology
    pub fn current() -> Self {
        Self {
            version: CURRENT_VERSION,
            namespaces: NAMESPACES_1_0.iter().copied().collect(),
            excluded: RETIRED_IN_1_0.iter().copied().collect(),
        }
    }

    /// The legacy ontology
    pub fn legacy() -> Self {
        Self {
            version: LEGACY_VERSION,
            namespaces: NAMESPACES_0_9.iter().copied().collect(),
            excluded: ABSENT_IN_0_9.iter().copied().collect(),
        }
    }

    /// Ontology by version string
    pub fn for_version(version: &str) -> Result<Self> {
        match version {
            CURRENT_VERSION => Ok(Self::current()),
            LEGACY_VERSION => Ok(Self::legacy()),
            other => Err(NodeError::validation(format!(
                "unknown ontology version {other}"
            ))),
        }
    }

    /// Version string
    pub fn version(&self) -> &str {
        self.version
    }

    /// Namespaces defined in this version
    pub fn namespaces(&self) -> impl Iterator<Item = &str> + '_ {
        self.namespaces.iter().copied()
    }

    /// Whether `label` is valid under this version
    pub fn is_valid(&self, label: &Label) -> bool {
        self.namespaces.contains(label.namespace()) && !self.excluded.contains(label.as_str())
    }

    /// Translate one label into `target`'s vocabulary
    fn translate(&self, label: &Label, target: &LabelOntology) -> Option<Label> {
        let mapped = match (self.version, target.version) {
            (LEGACY_VERSION, CURRENT_VERSION) => RENAMES_0_9_TO_1_0
                .iter()
                .find(|(old, _)| *old == label.as_str())
                .map(|(_, new)| *new),
            (CURRENT_VERSION, LEGACY_VERSION) => RENAMES_0_9_TO_1_0
                .iter()
                .find(|(_, new)| *new == label.as_str())
                .map(|(old, _)| *old),
            _ => None,
        };
        let candidate = match mapped {
            Some(name) => Label::parse(name).ok()?,
            None => label.clone(),
        };
        target.is_valid(&candidate).then_some(candidate)
    }
}

/// Migrate a label set to `to_version`, upgrading or downgrading.
///
/// Downgrades drop labels the older version cannot express (for example the
/// `cluster` namespace).
pub fn migrate(set: &LabelSet, to_version: &str) -> Result<LabelSet> {
    let from = LabelOntology::for_version(&set.ontology_version)?;
    let to = LabelOntology::for_version(to_version)?;
    if from == to {
        return Ok(set.clone());
    }
    let labels: BTreeSet<Label> = set
        .labels
        .iter()
        .filter_map(|label| from.translate(label, &to))
        .collect();
    debug!(
        event_id = %set.event_id,
        from = from.version(),
        to = to.version(),
        dropped = set.labels.len() - labels.len(),
        "migrated label set"
    );
    Ok(LabelSet {
        event_id: set.event_id,
        ontology_version: to.version().to_string(),
        labels,
    })
}
