//! Capsule wire format and verification

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use yachaq_consent::OutputMode;
use yachaq_core::{to_canonical_bytes, CapsuleId, ContractId, NodeError, PlanId, Result};
use yachaq_crypto::{
    aead::NONCE_LEN, sha256_parts, verify_signature, Digest, PublicKey, SealedBox,
    SignatureBytes,
};

/// Capsule format version
pub const CAPSULE_SCHEMA_VERSION: &str = "1.0";
/// Payload cipher
pub const PAYLOAD_ALGORITHM: &str = "ChaCha20-Poly1305";

const CAPSULE_DOMAIN: &[u8] = b"yachaq-capsule-v1";

/// What the payload holds, readable without decrypting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSummary {
    /// Output rows
    pub record_count: u64,
    /// Contract labels
    pub labels: BTreeSet<String>,
    /// Plaintext payload size
    pub payload_size: u64,
    /// Contract output mode
    pub output_mode: OutputMode,
}

/// Cleartext capsule header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleHeader {
    /// Capsule id
    pub capsule_id: CapsuleId,
    /// Plan that produced the payload
    pub plan_id: PlanId,
    /// Governing contract
    pub contract_id: ContractId,
    /// Requester the capsule is addressed to
    pub requester_id: String,
    /// Device pairwise key that signs the capsule
    pub ds_key: PublicKey,
    /// Creation time
    pub created_at_ms: u64,
    /// Expiry time; the content key is shredded after it
    pub expires_at_ms: u64,
    /// Capsule format version
    pub schema_version: String,
    /// Output field names
    pub schema: Vec<String>,
    /// Payload summary
    pub summary: CapsuleSummary,
}

/// Encrypted payload and the content key sealed to the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Payload ciphertext with tag
    pub ciphertext: Vec<u8>,
    /// Payload nonce
    pub nonce: [u8; NONCE_LEN],
    /// Content key sealed to the requester's X25519 key
    pub wrapped_key: SealedBox,
    /// Local handle of the content key
    pub key_id: String,
    /// Payload cipher
    pub algorithm: String,
    /// Fingerprint of the recipient X25519 key
    pub recipient_fingerprint: String,
}

/// Integrity and origin proofs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleProofs {
    /// Hash over header and payload
    pub capsule_hash: Digest,
    /// Hash of the executed plan
    pub plan_hash: Digest,
    /// Hash of the governing contract
    pub contract_hash: Digest,
    /// Device signature binding `capsule_hash` to the contract
    pub ds_signature: SignatureBytes,
}

/// A sealed, signed, time-limited result container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCapsule {
    /// Cleartext header
    pub header: CapsuleHeader,
    /// Encrypted payload
    pub payload: EncryptedPayload,
    /// Proofs
    pub proofs: CapsuleProofs,
    /// Governing contract, repeated outside the hashed header
    pub contract_id: ContractId,
}

impl TimeCapsule {
    /// Capsule id
    pub fn id(&self) -> CapsuleId {
        self.header.capsule_id
    }

    /// Whether the capsule is past its TTL at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.header.expires_at_ms
    }

    /// Recompute the capsule hash from header and payload
    pub fn compute_hash(&self) -> Result<Digest> {
        capsule_hash(&self.header, &self.payload)
    }

    /// Serialized form sent over the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self)
    }

    /// Parse the wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| NodeError::serialization(format!("invalid capsule: {e}")))
    }

    /// Check structure, hash and signature against `ds_key`, then the TTL.
    ///
    /// Integrity problems are reported before expiry so a tampered capsule is
    /// never mistaken for a merely stale one.
    pub fn verify(&self, ds_key: &PublicKey, now_ms: u64) -> Result<()> {
        if self.header.contract_id != self.contract_id {
            return Err(NodeError::integrity("contract id differs between header and capsule"));
        }
        if &self.header.ds_key != ds_key {
            return Err(NodeError::integrity("capsule signed by an unexpected key"));
        }
        if self.compute_hash()? != self.proofs.capsule_hash {
            return Err(NodeError::integrity(format!(
                "capsule {} hash mismatch",
                self.id()
            )));
        }
        verify_signature(
            ds_key,
            &signing_message(&self.proofs.capsule_hash, &self.contract_id),
            &self.proofs.ds_signature,
        )?;
        if self.is_expired(now_ms) {
            return Err(NodeError::ttl_expired(format!("capsule {} expired", self.id())));
        }
        Ok(())
    }
}

/// Hash over canonical header and payload
pub fn capsule_hash(header: &CapsuleHeader, payload: &EncryptedPayload) -> Result<Digest> {
    Ok(sha256_parts(&[
        &to_canonical_bytes(header)?,
        &to_canonical_bytes(payload)?,
    ]))
}

/// Message the device signs: domain, capsule hash, contract id
pub fn signing_message(capsule_hash: &Digest, contract_id: &ContractId) -> Vec<u8> {
    let contract = contract_id.to_string();
    let mut message = Vec::with_capacity(CAPSULE_DOMAIN.len() + 32 + contract.len());
    message.extend_from_slice(CAPSULE_DOMAIN);
    message.extend_from_slice(capsule_hash.as_bytes());
    message.extend_from_slice(contract.as_bytes());
    message
}

/// Associated data binding the payload ciphertext to its capsule
pub(crate) fn payload_aad(capsule_id: &CapsuleId, contract_id: &ContractId) -> Vec<u8> {
    format!("{capsule_id}|{contract_id}").into_bytes()
}
