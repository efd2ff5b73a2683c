//! Requester-side capsule opening

use crate::capsule::{payload_aad, TimeCapsule};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use yachaq_core::{AuditEventType, AuditRecord, AuditSink, Effects, NodeError, Result};
use yachaq_crypto::aead::{self, KEY_LEN};
use yachaq_crypto::{AgreementSecret, PublicKey};
use zeroize::Zeroizing;

/// Opens capsules addressed to one X25519 key
pub struct CapsuleOpener {
    secret: AgreementSecret,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl CapsuleOpener {
    /// Opener holding the recipient secret
    pub fn new(secret: AgreementSecret, audit: Arc<dyn AuditSink>, effects: Effects) -> Self {
        Self {
            secret,
            audit,
            effects,
        }
    }

    /// Verify against `ds_key`, then decrypt the payload bytes
    pub fn open(&self, capsule: &TimeCapsule, ds_key: &PublicKey) -> Result<Vec<u8>> {
        if let Err(e) = capsule.verify(ds_key, self.effects.now_ms()) {
            let event = match e {
                NodeError::TtlExpired { .. } => AuditEventType::TtlExpired,
                _ => AuditEventType::IntegrityFailure,
            };
            warn!(capsule_id = %capsule.id(), error = %e, "capsule refused");
            self.audit
                .append(AuditRecord::new(event).with("capsule_id", capsule.id()))?;
            return Err(e);
        }
        if capsule.payload.recipient_fingerprint != self.secret.public_key().fingerprint() {
            return Err(NodeError::access_denied("capsule is addressed to another key"));
        }

        let unwrapped = Zeroizing::new(
            capsule
                .payload
                .wrapped_key
                .open(&self.secret, capsule.id().to_string().as_bytes())?,
        );
        if unwrapped.len() != KEY_LEN {
            return Err(NodeError::integrity("content key has the wrong length"));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&unwrapped);
        aead::open(
            &key,
            &capsule.payload.nonce,
            &payload_aad(&capsule.header.capsule_id, &capsule.contract_id),
            &capsule.payload.ciphertext,
        )
    }

    /// Open and parse the JSON payload
    pub fn open_json(&self, capsule: &TimeCapsule, ds_key: &PublicKey) -> Result<Value> {
        let bytes = self.open(capsule, ds_key)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| NodeError::serialization(format!("capsule payload: {e}")))
    }
}

impl std::fmt::Debug for CapsuleOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleOpener")
            .field("recipient", &self.secret.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}
