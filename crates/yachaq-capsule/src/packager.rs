//! Packing VM output into time capsules

use crate::capsule::{
    capsule_hash, payload_aad, signing_message, CapsuleHeader, CapsuleProofs, CapsuleSummary,
    EncryptedPayload, TimeCapsule, CAPSULE_SCHEMA_VERSION, PAYLOAD_ALGORITHM,
};
use crate::store::CapsuleStore;
use std::sync::Arc;
use tracing::info;
use yachaq_consent::ActiveContract;
use yachaq_core::time::MS_PER_SEC;
use yachaq_core::{AuditEventType, AuditRecord, AuditSink, CapsuleId, Effects, NodeError, Result};
use yachaq_crypto::aead::{self, KEY_LEN, NONCE_LEN};
use yachaq_crypto::{KeyRing, SealedBox};
use yachaq_vm::{ValidatedPlan, VmOutput};
use zeroize::Zeroizing;

/// Seals VM output for the requester and keeps a local copy for TTL shredding
pub struct CapsulePackager {
    keyring: Arc<KeyRing>,
    store: Arc<CapsuleStore>,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl CapsulePackager {
    /// Packager signing with `keyring` and filing copies in `store`
    pub fn new(
        keyring: Arc<KeyRing>,
        store: Arc<CapsuleStore>,
        audit: Arc<dyn AuditSink>,
        effects: Effects,
    ) -> Self {
        Self {
            keyring,
            store,
            audit,
            effects,
        }
    }

    /// Pack `output` of `plan` under `contract`
    pub fn pack(
        &self,
        output: &VmOutput,
        plan: &ValidatedPlan,
        contract: &ActiveContract,
    ) -> Result<TimeCapsule> {
        let now = self.effects.now_ms();
        let terms = contract.terms();
        if !contract.is_active_at(now) {
            return Err(NodeError::ttl_expired(format!(
                "contract {} is not active",
                contract.id()
            )));
        }
        if output.contract_id != contract.id()
            || plan.contract_id() != contract.id()
            || output.plan_id != plan.plan_id()
        {
            return Err(NodeError::validation("output, plan and contract do not match"));
        }
        let ds_key = self.keyring.pairwise(&terms.requester_id)?;
        if ds_key != terms.ds_key {
            return Err(NodeError::integrity(
                "pairwise key no longer matches the contract",
            ));
        }

        let plaintext = Zeroizing::new(output.canonical_bytes()?);
        let capsule_id = CapsuleId::generate(&self.effects);
        let content_key = Zeroizing::new(self.effects.random_bytes::<KEY_LEN>());
        let nonce: [u8; NONCE_LEN] = self.effects.random_bytes();
        let aad = payload_aad(&capsule_id, &contract.id());
        let ciphertext = aead::seal(&content_key, &nonce, &aad, &plaintext)?;
        let wrapped_key = SealedBox::seal(
            &terms.requester_agreement_key,
            &content_key[..],
            capsule_id.to_string().as_bytes(),
            &self.effects,
        )?;

        let header = CapsuleHeader {
            capsule_id,
            plan_id: plan.plan_id(),
            contract_id: contract.id(),
            requester_id: terms.requester_id.clone(),
            ds_key,
            created_at_ms: now,
            expires_at_ms: now + plan.capsule_ttl_secs() * MS_PER_SEC,
            schema_version: CAPSULE_SCHEMA_VERSION.to_string(),
            schema: output.schema.clone(),
            summary: CapsuleSummary {
                record_count: output.rows.len() as u64,
                labels: terms.scope.labels.clone(),
                payload_size: plaintext.len() as u64,
                output_mode: terms.scope.output_mode,
            },
        };
        let payload = EncryptedPayload {
            ciphertext,
            nonce,
            wrapped_key,
            key_id: hex_id(&self.effects.random_bytes::<8>()),
            algorithm: PAYLOAD_ALGORITHM.to_string(),
            recipient_fingerprint: terms.requester_agreement_key.fingerprint(),
        };
        let hash = capsule_hash(&header, &payload)?;
        let ds_signature = self
            .keyring
            .sign_pairwise(&terms.requester_id, &signing_message(&hash, &contract.id()))?;
        let capsule = TimeCapsule {
            header,
            payload,
            proofs: CapsuleProofs {
                capsule_hash: hash,
                plan_hash: plan.plan_hash(),
                contract_hash: contract.contract_hash(),
                ds_signature,
            },
            contract_id: contract.id(),
        };

        self.store.insert(capsule.clone(), content_key);
        self.audit.append(
            AuditRecord::new(AuditEventType::CapsuleCreated)
                .with("capsule_id", capsule_id)
                .with("plan_id", plan.plan_id())
                .with("contract_id", contract.id())
                .with("capsule_hash", hash.to_hex()),
        )?;
        info!(
            capsule_id = %capsule_id,
            expires_at_ms = capsule.header.expires_at_ms,
            "capsule created"
        );
        Ok(capsule)
    }
}

fn hex_id(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl std::fmt::Debug for CapsulePackager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsulePackager").finish_non_exhaustive()
    }
}
