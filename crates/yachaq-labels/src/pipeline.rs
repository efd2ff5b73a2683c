//! Vault to labeled event pipeline

use crate::engine::LabelEngine;
use crate::event::CanonicalEvent;
use crate::features::FeatureExtractor;
use crate::normalizer::NormalizerRegistry;
use tracing::{debug, warn};
use yachaq_core::{RawRef, Result};
use yachaq_vault::{LocalVault, VaultCaller};

/// Normalize, extract and label vault records.
///
/// Reads go through the vault as [`VaultCaller::FeatureExtractor`]; plaintext
/// never outlives a single `process` call.
#[derive(Debug, Clone, Default)]
pub struct IngestPipeline {
    registry: NormalizerRegistry,
    extractor: FeatureExtractor,
    engine: LabelEngine,
}

impl IngestPipeline {
    /// Pipeline with explicit stages
    pub fn new(registry: NormalizerRegistry, extractor: FeatureExtractor, engine: LabelEngine) -> Self {
        Self {
            registry,
            extractor,
            engine,
        }
    }

    /// Pipeline with the built-in normalizers, default extractor and current ontology
    pub fn with_defaults() -> Self {
        Self::new(
            NormalizerRegistry::with_defaults(),
            FeatureExtractor::default(),
            LabelEngine::default(),
        )
    }

    /// Normalizer registry
    pub fn registry(&self) -> &NormalizerRegistry {
        &self.registry
    }

    /// Produce one fully labeled event
    pub fn process(&self, vault: &LocalVault, raw_ref: &RawRef) -> Result<CanonicalEvent> {
        self.process_as(vault, raw_ref, &VaultCaller::FeatureExtractor)
    }

    /// Same as [`process`](Self::process), reading as `caller`
    pub fn process_as(
        &self,
        vault: &LocalVault,
        raw_ref: &RawRef,
        caller: &VaultCaller,
    ) -> Result<CanonicalEvent> {
        let metadata = vault.get_metadata(raw_ref)?;
        let plaintext = vault.get(raw_ref, caller)?;
        let mut event = self.registry.normalize(
            raw_ref,
            &metadata.source,
            &metadata.record_type,
            &plaintext,
        )?;
        drop(plaintext);
        let features = self.extractor.extract(&event)?;
        self.engine.apply(&mut event, features)?;
        debug!(%raw_ref, record_type = %event.record_type, labels = event.labels.len(), "ingested record");
        Ok(event)
    }

    /// Process every object with a registered record type, skipping failures
    pub fn process_all(&self, vault: &LocalVault) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();
        for record_type in self.registry.record_types() {
            for raw_ref in vault.list(&record_type) {
                match self.process(vault, &raw_ref) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(%raw_ref, error = %e, "skipping record"),
                }
            }
        }
        events
    }
}
