//! Anonymous sealed boxes to an X25519 recipient
//!
//! A fresh ephemeral keypair per box; the AEAD key is HKDF over the shared secret
//! salted with both public keys. Only the holder of the recipient secret can open.

use crate::aead::{self, NONCE_LEN};
use crate::agreement::AgreementSecret;
use crate::types::AgreementPublicKey;
use serde::{Deserialize, Serialize};
use yachaq_core::{Effects, Result};

const SEALED_BOX_INFO: &[u8] = b"yachaq-sealed-box-v1";

/// Ciphertext addressed to one X25519 public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Sender's ephemeral public key
    pub ephemeral_public: AgreementPublicKey,
    /// AEAD nonce
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with tag
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// Seal `plaintext` to `recipient`, authenticating `aad`
    pub fn seal(
        recipient: &AgreementPublicKey,
        plaintext: &[u8],
        aad: &[u8],
        effects: &Effects,
    ) -> Result<Self> {
        let ephemeral = AgreementSecret::generate(effects);
        let ephemeral_public = ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(recipient)?;
        let key = box_key(&shared, &ephemeral_public, recipient)?;
        let nonce: [u8; NONCE_LEN] = effects.random_bytes();
        let ciphertext = aead::seal(&key, &nonce, aad, plaintext)?;
        Ok(Self {
            ephemeral_public,
            nonce,
            ciphertext,
        })
    }

    /// Open with the recipient's secret
    pub fn open(&self, recipient: &AgreementSecret, aad: &[u8]) -> Result<Vec<u8>> {
        let shared = recipient.diffie_hellman(&self.ephemeral_public)?;
        let key = box_key(&shared, &self.ephemeral_public, &recipient.public_key())?;
        aead::open(&key, &self.nonce, aad, &self.ciphertext)
    }
}

fn box_key(
    shared: &[u8; 32],
    ephemeral: &AgreementPublicKey,
    recipient: &AgreementPublicKey,
) -> Result<zeroize::Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    aead::hkdf_sha256(&salt, shared, SEALED_BOX_INFO)
}
