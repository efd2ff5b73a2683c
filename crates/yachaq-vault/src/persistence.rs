//! On-disk layout: `manifest.json` plus one `blobs/<object-id>.bin` per object.
//!
//! The master key is never written; callers keep it in the platform key store and
//! pass it back to [`LocalVault::restore`].

use crate::types::VaultObject;
use crate::vault::LocalVault;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use yachaq_core::{AuditSink, Effects, NodeError, Result};

const MANIFEST_FILE: &str = "manifest.json";
const BLOB_DIR: &str = "blobs";

#[derive(Serialize, Deserialize)]
struct VaultManifest {
    format_version: u32,
    key_version: u32,
    objects: Vec<VaultObject>,
}

impl LocalVault {
    /// Write the vault to `dir`
    pub fn persist(&self, dir: &Path) -> Result<()> {
        let blob_dir = dir.join(BLOB_DIR);
        std::fs::create_dir_all(&blob_dir)?;
        let _snapshot = self.rotation.read();

        let mut objects = Vec::new();
        for cell in self.objects.read().values() {
            let object = cell.read();
            if object.is_shredded() {
                continue;
            }
            let blob_path = blob_dir.join(format!("{}.bin", object.raw_ref.object_id()));
            std::fs::write(&blob_path, &object.ciphertext)?;
            objects.push(object.clone());
        }

        let manifest = VaultManifest {
            format_version: 1,
            key_version: self.master.read().current_version(),
            objects,
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(dir.join(MANIFEST_FILE), bytes)?;
        tracing::info!(
            dir = %dir.display(),
            objects = manifest.objects.len(),
            "Vault persisted"
        );
        Ok(())
    }

    /// Load a vault written by [`LocalVault::persist`]
    pub fn restore(
        dir: &Path,
        master_key: [u8; 32],
        audit: Arc<dyn AuditSink>,
        effects: Effects,
    ) -> Result<Self> {
        let manifest: VaultManifest =
            serde_json::from_slice(&std::fs::read(dir.join(MANIFEST_FILE))?)?;
        if manifest.format_version != 1 {
            return Err(NodeError::storage(format!(
                "unsupported vault format {}",
                manifest.format_version
            )));
        }

        let vault = Self::with_master_key(master_key, manifest.key_version, audit, effects);
        {
            let mut index = vault.objects.write();
            for mut object in manifest.objects {
                if object.key_version != manifest.key_version {
                    return Err(NodeError::storage(format!(
                        "object {} wrapped with stale key version {}",
                        object.raw_ref, object.key_version
                    )));
                }
                let blob_path = dir
                    .join(BLOB_DIR)
                    .join(format!("{}.bin", object.raw_ref.object_id()));
                object.ciphertext = std::fs::read(&blob_path)?;
                index.insert(object.raw_ref.clone(), Arc::new(RwLock::new(object)));
            }
        }
        tracing::info!(dir = %dir.display(), "Vault restored");
        Ok(vault)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{RawItem, VaultCaller};
    use crate::vault::LocalVault;
    use std::sync::Arc;
    use yachaq_audit::AuditLog;
    use yachaq_core::Effects;

    #[test]
    fn test_persist_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (effects, _) = Effects::deterministic(90, 0);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        let master_key = [4u8; 32];

        let vault = LocalVault::with_master_key(master_key, 1, audit.clone(), effects.clone());
        let kept = vault
            .put(RawItem::new("strava", "trip", b"{\"km\":3}".to_vec()))
            .unwrap();
        let shredded = vault
            .put(RawItem::new("strava", "trip", b"{\"km\":4}".to_vec()))
            .unwrap();
        vault.crypto_shred(&shredded).unwrap();
        vault.persist(dir.path()).unwrap();

        let restored = LocalVault::restore(dir.path(), master_key, audit.clone(), effects.clone()).unwrap();
        assert_eq!(
            restored.get(&kept, &VaultCaller::QueryPlanVm).unwrap(),
            b"{\"km\":3}"
        );
        assert!(!restored.exists(&shredded));

        let wrong = LocalVault::restore(dir.path(), [5u8; 32], audit, effects).unwrap();
        assert!(wrong.get(&kept, &VaultCaller::QueryPlanVm).is_err());
    }
}
