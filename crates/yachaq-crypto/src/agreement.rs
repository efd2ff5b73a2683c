//! X25519 key agreement on curve25519-dalek's Montgomery form

use crate::types::AgreementPublicKey;
use curve25519_dalek::montgomery::MontgomeryPoint;
use yachaq_core::{Effects, NodeError, Result};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// X25519 secret scalar. Zeroized on drop; never serialized.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AgreementSecret([u8; 32]);

impl AgreementSecret {
    /// Fresh secret from the injected RNG
    pub fn generate(effects: &Effects) -> Self {
        Self(effects.random_bytes())
    }

    /// Wrap existing secret bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_secret_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Matching public key
    pub fn public_key(&self) -> AgreementPublicKey {
        AgreementPublicKey(MontgomeryPoint::mul_base_clamped(self.0).to_bytes())
    }

    /// Shared secret with `peer`. Rejects low-order peer points, which would
    /// produce an all-zero output.
    pub fn diffie_hellman(&self, peer: &AgreementPublicKey) -> Result<Zeroizing<[u8; 32]>> {
        let shared = MontgomeryPoint(peer.0).mul_clamped(self.0);
        let bytes = Zeroizing::new(shared.to_bytes());
        if bytes.iter().all(|b| *b == 0) {
            return Err(NodeError::integrity("peer key is a low-order point"));
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for AgreementSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AgreementSecret")
            .field(&self.public_key())
            .finish()
    }
}
