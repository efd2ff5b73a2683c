//! Namespaced labels

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use yachaq_core::{NodeError, Result};

/// A `namespace:value` label such as `mobility:trip` or `time:evening`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// Parse and validate: lowercase namespace, lowercase/digit/underscore value
    pub fn parse(s: &str) -> Result<Self> {
        if is_valid_label(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(NodeError::validation(format!("invalid label: {s}")))
        }
    }

    /// Build from parts
    pub fn new(namespace: &str, value: &str) -> Result<Self> {
        Self::parse(&format!("{namespace}:{value}"))
    }

    /// Namespace part
    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map(|(ns, _)| ns).unwrap_or_default()
    }

    /// Value part
    pub fn value(&self) -> &str {
        self.0.split_once(':').map(|(_, v)| v).unwrap_or_default()
    }

    /// Full string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `^[a-z]+:[a-z0-9_]+$`
pub fn is_valid_label(s: &str) -> bool {
    let Some((ns, value)) = s.split_once(':') else {
        return false;
    };
    !ns.is_empty()
        && ns.chars().all(|c| c.is_ascii_lowercase())
        && !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = NodeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Label> for String {
    fn from(value: Label) -> Self {
        value.0
    }
}

/// Labels of one event under one ontology version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    /// Event the labels belong to
    pub event_id: Uuid,
    /// Ontology version the labels conform to
    pub ontology_version: String,
    /// The labels
    pub labels: BTreeSet<Label>,
}

impl LabelSet {
    /// Whether the set carries `label`
    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.as_str() == label)
    }

    /// Labels in one namespace
    pub fn in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Label> + 'a {
        self.labels.iter().filter(move |l| l.namespace() == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parts() {
        let label = Label::parse("mobility:trip").unwrap();
        assert_eq!(label.namespace(), "mobility");
        assert_eq!(label.value(), "trip");
        assert!(Label::parse("cluster:c07").is_ok());
    }

    #[test]
    fn test_invalid_labels() {
        for bad in ["", "trip", "Mobility:trip", "mobility:", ":trip", "a:b c", "a:b:c"] {
            assert!(Label::parse(bad).is_err(), "{bad}");
        }
    }
}
