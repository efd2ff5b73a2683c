//! Envelope encryption: per-object DEKs wrapped by versioned master keys

use crate::error::VaultErrorBuilder;
use crate::types::WrappedKey;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use std::collections::BTreeMap;
use yachaq_core::{Effects, NodeError, Result};
use zeroize::Zeroizing;

/// AES-256-GCM encrypt
pub(crate) fn encrypt(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|e| NodeError::crypto(format!("AES-GCM encryption failed: {e}")))
}

/// AES-256-GCM decrypt; a bad tag is an integrity failure
pub(crate) fn decrypt(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| NodeError::integrity("vault AES-GCM authentication failed"))
}

/// Master keys by version. During rotation both the old and new versions are
/// present so reads never observe a missing key.
pub(crate) struct MasterKeys {
    current: u32,
    keys: BTreeMap<u32, Zeroizing<[u8; 32]>>,
}

impl MasterKeys {
    pub(crate) fn new(version: u32, key: [u8; 32]) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, Zeroizing::new(key));
        Self {
            current: version,
            keys,
        }
    }

    pub(crate) fn current_version(&self) -> u32 {
        self.current
    }

    /// Install a new current version, keeping older ones until retired
    pub(crate) fn install(&mut self, version: u32, key: [u8; 32]) {
        self.keys.insert(version, Zeroizing::new(key));
        self.current = version;
    }

    /// Drop every version except the current one
    pub(crate) fn retire_old(&mut self) {
        let current = self.current;
        self.keys.retain(|v, _| *v == current);
    }

    fn key(&self, version: u32) -> Result<&[u8; 32]> {
        self.keys
            .get(&version)
            .map(|k| &**k)
            .ok_or_else(|| VaultErrorBuilder::missing_key_version(version))
    }

    pub(crate) fn wrap(
        &self,
        dek: &[u8; 32],
        aad: &[u8],
        effects: &Effects,
    ) -> Result<(u32, WrappedKey)> {
        let nonce: [u8; 12] = effects.random_bytes();
        let ciphertext = encrypt(self.key(self.current)?, &nonce, aad, dek)?;
        Ok((self.current, WrappedKey { nonce, ciphertext }))
    }

    pub(crate) fn unwrap_dek(
        &self,
        version: u32,
        wrapped: &WrappedKey,
        aad: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>> {
        let plain = Zeroizing::new(decrypt(
            self.key(version)?,
            &wrapped.nonce,
            aad,
            &wrapped.ciphertext,
        )?);
        let mut dek = Zeroizing::new([0u8; 32]);
        if plain.len() != 32 {
            return Err(NodeError::integrity("unwrapped DEK has wrong length"));
        }
        dek.copy_from_slice(&plain);
        Ok(dek)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_across_rotation() {
        let (effects, _) = Effects::deterministic(70, 0);
        let mut keys = MasterKeys::new(1, [1u8; 32]);
        let dek = [42u8; 32];
        let (v1, wrapped) = keys.wrap(&dek, b"ref", &effects).unwrap();
        assert_eq!(v1, 1);

        keys.install(2, [2u8; 32]);
        assert_eq!(*keys.unwrap_dek(1, &wrapped, b"ref").unwrap(), dek);

        keys.retire_old();
        assert!(keys.unwrap_dek(1, &wrapped, b"ref").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let (effects, _) = Effects::deterministic(71, 0);
        let keys = MasterKeys::new(1, [1u8; 32]);
        let (v, wrapped) = keys.wrap(&[7u8; 32], b"ref-a", &effects).unwrap();
        assert!(keys.unwrap_dek(v, &wrapped, b"ref-b").is_err());
    }
}
