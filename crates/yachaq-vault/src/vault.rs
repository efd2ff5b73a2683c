//! The local vault

use crate::error::VaultErrorBuilder;
use crate::keys::{decrypt, encrypt, MasterKeys};
use crate::types::{ObjectMetadata, RawItem, VaultCaller, VaultObject, VaultStats};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use yachaq_core::{AuditEventType, AuditRecord, AuditSink, Effects, RawRef, Result};
use yachaq_crypto::sha256;
use zeroize::Zeroizing;

pub(crate) type ObjectCell = Arc<RwLock<VaultObject>>;

/// Encrypted store for raw personal records.
///
/// Each object has its own DEK (AES-256-GCM) wrapped by a versioned master key,
/// and its own reader/writer lock. The object index lock is only held long enough
/// to clone the cell handle, so reads of different objects never contend.
pub struct LocalVault {
    pub(crate) objects: RwLock<BTreeMap<RawRef, ObjectCell>>,
    pub(crate) master: RwLock<MasterKeys>,
    /// Shared by writers from DEK wrap to index insert; exclusive for rotation
    pub(crate) rotation: RwLock<()>,
    audit: Arc<dyn AuditSink>,
    pub(crate) effects: Effects,
    reads: AtomicU64,
    denials: AtomicU64,
    writes: AtomicU64,
}

impl LocalVault {
    /// Vault with a fresh random master key
    pub fn new(audit: Arc<dyn AuditSink>, effects: Effects) -> Self {
        let key: [u8; 32] = effects.random_bytes();
        Self::with_master_key(key, 1, audit, effects)
    }

    /// Vault using a supplied master key version
    pub fn with_master_key(
        master_key: [u8; 32],
        key_version: u32,
        audit: Arc<dyn AuditSink>,
        effects: Effects,
    ) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            master: RwLock::new(MasterKeys::new(key_version, master_key)),
            rotation: RwLock::new(()),
            audit,
            effects,
            reads: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    fn cell(&self, raw_ref: &RawRef) -> Result<ObjectCell> {
        self.objects
            .read()
            .get(raw_ref)
            .cloned()
            .ok_or_else(|| VaultErrorBuilder::not_found(raw_ref))
    }

    /// Encrypt and store a raw item
    pub fn put(&self, item: RawItem) -> Result<RawRef> {
        let raw_ref = RawRef::generate(&self.effects);
        let aad = raw_ref.to_string();
        let dek = Zeroizing::new(self.effects.random_bytes::<32>());
        let nonce: [u8; 12] = self.effects.random_bytes();
        let ciphertext = encrypt(&dek, &nonce, aad.as_bytes(), &item.data)?;
        let _writing = self.rotation.read();
        let (key_version, wrapped) = self.master.read().wrap(&dek, aad.as_bytes(), &self.effects)?;

        let now = self.effects.now_ms();
        let object = VaultObject {
            raw_ref: raw_ref.clone(),
            ciphertext,
            nonce,
            wrapped_dek: Some(wrapped),
            key_version,
            created_at_ms: now,
            expires_at_ms: item.ttl_ms.map(|ttl| now.saturating_add(ttl)),
            metadata: ObjectMetadata {
                source: item.source,
                record_type: item.record_type,
                original_size: item.data.len() as u64,
                checksum: sha256(&item.data),
            },
        };
        tracing::debug!(
            raw_ref = %raw_ref,
            record_type = %object.metadata.record_type,
            "Vault object stored"
        );
        self.objects
            .write()
            .insert(raw_ref.clone(), Arc::new(RwLock::new(object)));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(raw_ref)
    }

    /// Decrypt an object for an allowlisted caller
    pub fn get(&self, raw_ref: &RawRef, caller: &VaultCaller) -> Result<Vec<u8>> {
        if !caller.may_read() {
            self.denials.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(raw_ref = %raw_ref, caller = %caller, "Vault read denied");
            self.audit.append(
                AuditRecord::new(AuditEventType::VaultAccessDenied)
                    .with("raw_ref", raw_ref)
                    .with("caller", caller),
            )?;
            return Err(VaultErrorBuilder::access_denied(caller));
        }

        let cell = self.cell(raw_ref)?;
        let object = cell.read();
        if object.is_expired(self.effects.now_ms()) {
            self.audit.append(
                AuditRecord::new(AuditEventType::TtlExpired).with("raw_ref", raw_ref),
            )?;
            return Err(VaultErrorBuilder::expired(raw_ref));
        }
        let wrapped = object
            .wrapped_dek
            .as_ref()
            .ok_or_else(|| VaultErrorBuilder::shredded(raw_ref))?;

        let aad = raw_ref.to_string();
        let dek = self
            .master
            .read()
            .unwrap_dek(object.key_version, wrapped, aad.as_bytes())?;
        let plaintext = decrypt(&dek, &object.nonce, aad.as_bytes(), &object.ciphertext)?;
        if sha256(&plaintext) != object.metadata.checksum {
            return Err(VaultErrorBuilder::checksum_mismatch(raw_ref));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }

    /// Metadata without decryption
    pub fn get_metadata(&self, raw_ref: &RawRef) -> Result<ObjectMetadata> {
        Ok(self.cell(raw_ref)?.read().metadata.clone())
    }

    /// Whether a readable object exists
    pub fn exists(&self, raw_ref: &RawRef) -> bool {
        self.cell(raw_ref)
            .map(|cell| !cell.read().is_shredded())
            .unwrap_or(false)
    }

    /// Live references of `record_type`, sorted
    pub fn list(&self, record_type: &str) -> Vec<RawRef> {
        self.objects
            .read()
            .iter()
            .filter(|(_, cell)| {
                let object = cell.read();
                !object.is_shredded() && object.metadata.record_type == record_type
            })
            .map(|(raw_ref, _)| raw_ref.clone())
            .collect()
    }

    /// Live references of every record type, sorted
    pub fn list_all(&self) -> Vec<RawRef> {
        self.objects
            .read()
            .iter()
            .filter(|(_, cell)| !cell.read().is_shredded())
            .map(|(raw_ref, _)| raw_ref.clone())
            .collect()
    }

    /// Shred and remove an object
    pub fn delete(&self, raw_ref: &RawRef) -> Result<()> {
        self.crypto_shred(raw_ref)?;
        self.objects.write().remove(raw_ref);
        Ok(())
    }

    /// Destroy an object's DEK; the ciphertext becomes unreadable
    pub fn crypto_shred(&self, raw_ref: &RawRef) -> Result<()> {
        let cell = self.cell(raw_ref)?;
        {
            let mut object = cell.write();
            if object.wrapped_dek.take().is_none() {
                return Ok(());
            }
            object.ciphertext.clear();
        }
        tracing::info!(raw_ref = %raw_ref, "Vault object crypto-shredded");
        self.audit
            .append(AuditRecord::new(AuditEventType::CryptoShred).with("raw_ref", raw_ref))
    }

    /// Shred and remove every object past its TTL; returns the removed refs
    pub fn purge_expired(&self) -> Result<Vec<RawRef>> {
        let now = self.effects.now_ms();
        let expired: Vec<RawRef> = self
            .objects
            .read()
            .iter()
            .filter(|(_, cell)| cell.read().is_expired(now))
            .map(|(raw_ref, _)| raw_ref.clone())
            .collect();
        for raw_ref in &expired {
            self.delete(raw_ref)?;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Purged expired vault objects");
        }
        Ok(expired)
    }

    /// Re-wrap every DEK under a fresh master key. Ciphertext is untouched.
    pub fn rotate_master_key(&self) -> Result<u32> {
        let _rotating = self.rotation.write();
        let new_key: [u8; 32] = self.effects.random_bytes();
        let new_version = {
            let mut master = self.master.write();
            let version = master.current_version().saturating_add(1);
            master.install(version, new_key);
            version
        };

        let cells: Vec<(RawRef, ObjectCell)> = self
            .objects
            .read()
            .iter()
            .map(|(r, c)| (r.clone(), c.clone()))
            .collect();
        let mut rewrapped = 0usize;
        for (raw_ref, cell) in cells {
            let mut object = cell.write();
            let Some(wrapped) = object.wrapped_dek.as_ref() else {
                continue;
            };
            if object.key_version == new_version {
                continue;
            }
            let aad = raw_ref.to_string();
            let master = self.master.read();
            let dek = master.unwrap_dek(object.key_version, wrapped, aad.as_bytes())?;
            let (version, wrapped) = master.wrap(&dek, aad.as_bytes(), &self.effects)?;
            object.wrapped_dek = Some(wrapped);
            object.key_version = version;
            rewrapped += 1;
        }

        self.master.write().retire_old();
        tracing::info!(key_version = new_version, rewrapped, "Vault master key rotated");
        self.audit.append(
            AuditRecord::new(AuditEventType::KeyRotated)
                .with("key_version", new_version)
                .with("objects", rewrapped),
        )?;
        Ok(new_version)
    }

    /// Counters
    pub fn stats(&self) -> VaultStats {
        let objects = self.objects.read();
        let shredded = objects.values().filter(|c| c.read().is_shredded()).count();
        VaultStats {
            objects: objects.len() - shredded,
            shredded,
            reads: self.reads.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            key_version: self.master.read().current_version(),
        }
    }
}

impl std::fmt::Debug for LocalVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalVault")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use yachaq_audit::AuditLog;
    use yachaq_core::NodeError;

    fn vault() -> (LocalVault, Arc<AuditLog>, Arc<yachaq_core::ManualClock>) {
        let (effects, clock) = Effects::deterministic(80, 1_000_000);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        (LocalVault::new(audit.clone(), effects), audit, clock)
    }

    fn trip(n: u32) -> RawItem {
        RawItem::new("strava", "trip", format!("{{\"n\":{n}}}").into_bytes())
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (vault, _, _) = vault();
        let raw_ref = vault.put(trip(1)).unwrap();
        assert!(raw_ref.to_string().starts_with("vault:"));
        let data = vault.get(&raw_ref, &VaultCaller::FeatureExtractor).unwrap();
        assert_eq!(data, b"{\"n\":1}");
        assert_eq!(vault.stats().reads, 1);
    }

    #[test]
    fn test_non_allowlisted_caller_denied_and_audited() {
        let (vault, audit, _) = vault();
        let raw_ref = vault.put(trip(1)).unwrap();
        assert_matches!(
            vault.get(&raw_ref, &VaultCaller::Connector),
            Err(NodeError::AccessDenied { .. })
        );
        assert_matches!(
            vault.get(&raw_ref, &VaultCaller::Other("ui".into())),
            Err(NodeError::AccessDenied { .. })
        );
        let export = audit.export().unwrap();
        assert_eq!(export.of_type(AuditEventType::VaultAccessDenied).len(), 2);
        assert_eq!(vault.stats().denials, 2);
        assert_eq!(vault.stats().reads, 0);
    }

    #[test]
    fn test_crypto_shred_makes_object_unreadable() {
        let (vault, audit, _) = vault();
        let raw_ref = vault.put(trip(1)).unwrap();
        vault.crypto_shred(&raw_ref).unwrap();
        assert!(!vault.exists(&raw_ref));
        assert!(vault.get(&raw_ref, &VaultCaller::QueryPlanVm).is_err());
        assert!(vault.list("trip").is_empty());
        assert_eq!(audit.export().unwrap().of_type(AuditEventType::CryptoShred).len(), 1);
    }

    #[test]
    fn test_rotation_keeps_objects_readable() {
        let (vault, audit, _) = vault();
        let refs: Vec<_> = (0..5).map(|n| vault.put(trip(n)).unwrap()).collect();
        let version = vault.rotate_master_key().unwrap();
        assert_eq!(version, 2);
        for (n, raw_ref) in refs.iter().enumerate() {
            let data = vault.get(raw_ref, &VaultCaller::QueryPlanVm).unwrap();
            assert_eq!(data, format!("{{\"n\":{n}}}").into_bytes());
        }
        assert_eq!(audit.export().unwrap().of_type(AuditEventType::KeyRotated).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_payloads_survive_rotation(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 1..8),
            rotations in 1u32..4,
        ) {
            let (vault, _, _) = vault();
            let refs: Vec<_> = payloads
                .iter()
                .map(|p| vault.put(RawItem::new("strava", "trip", p.clone())).unwrap())
                .collect();
            for _ in 0..rotations {
                vault.rotate_master_key().unwrap();
            }
            prop_assert_eq!(vault.stats().key_version, 1 + rotations);
            for (raw_ref, payload) in refs.iter().zip(&payloads) {
                prop_assert_eq!(&vault.get(raw_ref, &VaultCaller::QueryPlanVm).unwrap(), payload);
                prop_assert_eq!(
                    vault.get_metadata(raw_ref).unwrap().original_size,
                    payload.len() as u64
                );
            }
        }
    }

    #[test]
    fn test_list_is_sorted_and_filtered() {
        let (vault, _, _) = vault();
        for n in 0..4 {
            vault.put(trip(n)).unwrap();
        }
        vault
            .put(RawItem::new("health_connect", "steps", b"{}".to_vec()))
            .unwrap();
        let trips = vault.list("trip");
        assert_eq!(trips.len(), 4);
        let mut sorted = trips.clone();
        sorted.sort();
        assert_eq!(trips, sorted);
        assert_eq!(vault.list("steps").len(), 1);
        assert_eq!(vault.list_all().len(), 5);
    }

    #[test]
    fn test_purge_expired() {
        let (vault, _, clock) = vault();
        let short = vault.put(trip(1).with_ttl_ms(1_000)).unwrap();
        let long = vault.put(trip(2)).unwrap();
        clock.advance_ms(1_000);
        assert_matches!(
            vault.get(&short, &VaultCaller::QueryPlanVm),
            Err(NodeError::TtlExpired { .. })
        );
        assert_eq!(vault.purge_expired().unwrap(), vec![short.clone()]);
        assert!(!vault.exists(&short));
        assert!(vault.exists(&long));
    }

    #[test]
    fn test_metadata_without_decryption() {
        let (vault, _, _) = vault();
        let raw_ref = vault.put(trip(9)).unwrap();
        let meta = vault.get_metadata(&raw_ref).unwrap();
        assert_eq!(meta.record_type, "trip");
        assert_eq!(meta.original_size, 7);
        assert_eq!(vault.stats().reads, 0);
    }
}
