//! Ed25519 signing and verification

use crate::types::{PublicKey, SignatureBytes};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use yachaq_core::{NodeError, Result};

/// Verify an Ed25519 signature over `message`.
///
/// Any failure (malformed key, bad signature) maps to `IntegrityFailure`.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|e| NodeError::integrity(format!("malformed public key: {e}")))?;
    let sig = Signature::from_bytes(signature.as_bytes());
    key.verify_strict(message, &sig)
        .map_err(|e| NodeError::integrity(format!("Signature verification failed: {e}")))
}

/// Sign with a raw signing key
pub(crate) fn sign_with(key: &SigningKey, message: &[u8]) -> SignatureBytes {
    SignatureBytes(key.sign(message).to_bytes())
}

/// Public key of a signing key
pub(crate) fn public_of(key: &SigningKey) -> PublicKey {
    PublicKey(key.verifying_key().to_bytes())
}

/// Standalone Ed25519 identity for collaborators outside the KeyRing
/// (policy authorities, requesters in tests).
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    /// Derive from 32 secret bytes
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    /// Fresh identity from the injected RNG
    pub fn generate(effects: &yachaq_core::Effects) -> Self {
        let mut secret: [u8; 32] = effects.random_bytes();
        let identity = Self::from_secret(secret);
        zeroize::Zeroize::zeroize(&mut secret);
        identity
    }

    /// Public key
    pub fn public_key(&self) -> PublicKey {
        public_of(&self.key)
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        sign_with(&self.key, message)
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use yachaq_core::Effects;

    #[test]
    fn test_sign_verify() {
        let (effects, _) = Effects::deterministic(1, 0);
        let identity = SigningIdentity::generate(&effects);
        let sig = identity.sign(b"contract bytes");
        verify_signature(&identity.public_key(), b"contract bytes", &sig).unwrap();
    }

    #[test]
    fn test_tampered_message_fails() {
        let (effects, _) = Effects::deterministic(2, 0);
        let identity = SigningIdentity::generate(&effects);
        let sig = identity.sign(b"original");
        assert_matches!(
            verify_signature(&identity.public_key(), b"tampered", &sig),
            Err(NodeError::IntegrityFailure { .. })
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let (effects, _) = Effects::deterministic(3, 0);
        let signer = SigningIdentity::generate(&effects);
        let other = SigningIdentity::generate(&effects);
        let sig = signer.sign(b"msg");
        assert!(verify_signature(&other.public_key(), b"msg", &sig).is_err());
    }
}
