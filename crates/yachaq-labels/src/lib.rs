//! # YACHAQ Labels - Layer 3: Normalization and Labeling
//!
//! **Purpose**: Turn raw vault records into canonical, labeled events without
//! letting raw text escape.
//!
//! - Normalizers map connector JSON onto closed vocabularies
//! - The feature extractor emits buckets and cluster references only
//! - The label engine assigns namespaced labels under a versioned ontology
//! - The ingest pipeline reads the vault as the feature extractor

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Labeling rules
pub mod engine;

/// Canonical event model
pub mod event;

/// Derived features and leakage validation
pub mod features;

/// Namespaced labels
pub mod label;

/// Connector normalizers
pub mod normalizer;

/// Ontology versions and migration
pub mod ontology;

/// Vault ingest pipeline
pub mod pipeline;

pub use engine::LabelEngine;
pub use event::{AttributeValue, CanonicalEvent, EventCategory, SCHEMA_VERSION};
pub use features::{validate_no_leakage, DerivedFeatures, FeatureExtractor};
pub use label::{Label, LabelSet};
pub use normalizer::{HealthNormalizer, MobilityNormalizer, Normalizer, NormalizerRegistry};
pub use ontology::{migrate, LabelOntology};
pub use pipeline::IngestPipeline;
