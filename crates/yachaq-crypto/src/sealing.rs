//! Key material sealed under the device secret
//!
//! Generic AEAD container using AES-256-GCM with a BLAKE3-derived key. Used for
//! protecting the KeyRing's secret material and the vault's master keys on disk.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key,
};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use yachaq_core::{Effects, NodeError, Result};
use zeroize::{Zeroize, Zeroizing};

/// Keyring or vault master key, encrypted for storage.
///
/// The ciphertext is wiped on drop. `context` is bound into the key, and
/// `aad` is authenticated without being encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedData {
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// GCM nonce
    pub nonce: [u8; 12],
    /// Domain label mixed into the sealing key
    pub context: String,
    /// Authenticated cleartext bound to the ciphertext
    pub aad: Option<Vec<u8>>,
}

impl SealedData {
    /// Serialize `value` with bincode and seal it under `device_secret`.
    ///
    /// `context` separates keyring blobs from vault key blobs, e.g.
    /// `"yachaq-keyring-v1"`. The nonce comes from `effects`.
    pub fn seal_value<T: Serialize>(
        value: &T,
        device_secret: &[u8; 32],
        context: &str,
        associated_data: Option<&[u8]>,
        effects: &Effects,
    ) -> Result<Self> {
        let plaintext = Zeroizing::new(
            bincode::serialize(value)
                .map_err(|e| NodeError::serialization(format!("Failed to serialize: {e}")))?,
        );

        let nonce: [u8; 12] = effects.random_bytes();
        let cipher = Aes256Gcm::new(&derive_key(device_secret, context));

        let aad = associated_data.unwrap_or_default();
        let ciphertext = cipher
            .encrypt(
                &nonce.into(),
                Payload {
                    msg: &plaintext,
                    aad,
                },
            )
            .map_err(|e| NodeError::crypto(format!("AES-GCM encryption failed: {e}")))?;

        Ok(SealedData {
            ciphertext,
            nonce,
            context: context.to_string(),
            aad: associated_data.map(<[u8]>::to_vec),
        })
    }

    /// Unseal and deserialize.
    ///
    /// # Errors
    ///
    /// `IntegrityFailure` if the tag does not verify (wrong secret, tampered
    /// ciphertext or associated data); `Serialization` if the plaintext is not a `T`.
    pub fn unseal_value<T: serde::de::DeserializeOwned>(
        &self,
        device_secret: &[u8; 32],
    ) -> Result<T> {
        let cipher = Aes256Gcm::new(&derive_key(device_secret, &self.context));
        let aad = self.aad.as_deref().unwrap_or_default();

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    &self.nonce.into(),
                    Payload {
                        msg: &self.ciphertext,
                        aad,
                    },
                )
                .map_err(|_| NodeError::integrity("sealed data decryption failed"))?,
        );

        bincode::deserialize(&plaintext)
            .map_err(|e| NodeError::serialization(format!("Failed to deserialize: {e}")))
    }
}

/// AES-256 key from device secret and context via BLAKE3 with domain separation
fn derive_key(device_secret: &[u8; 32], context: &str) -> Key<Aes256Gcm> {
    let key: [u8; 32] = Hasher::new()
        .update(b"yachaq-sealing-v1:")
        .update(device_secret)
        .update(b":")
        .update(context.as_bytes())
        .finalize()
        .into();
    key.into()
}

impl Drop for SealedData {
    fn drop(&mut self) {
        self.ciphertext.zeroize();
        if let Some(aad) = self.aad.as_mut() {
            aad.zeroize();
        }
    }
}
