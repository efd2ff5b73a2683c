//! Local capsule copies and TTL crypto-shredding

use crate::capsule::{payload_aad, TimeCapsule};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use yachaq_core::{AuditEventType, AuditRecord, AuditSink, CapsuleId, Effects, NodeError, Result};
use yachaq_crypto::aead::{self, KEY_LEN};
use zeroize::Zeroizing;

struct LocalCopy {
    capsule: TimeCapsule,
    content_key: Option<Zeroizing<[u8; KEY_LEN]>>,
    shredded_at_ms: Option<u64>,
}

/// The device's copies of the capsules it packed, with their content keys.
///
/// Past the TTL, [`process_expired`](Self::process_expired) destroys the key
/// and the local ciphertext. The header stays behind as a tombstone until
/// [`prune_tombstones`](Self::prune_tombstones) drops it.
pub struct CapsuleStore {
    copies: RwLock<BTreeMap<CapsuleId, LocalCopy>>,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl CapsuleStore {
    /// Empty store
    pub fn new(audit: Arc<dyn AuditSink>, effects: Effects) -> Self {
        Self {
            copies: RwLock::new(BTreeMap::new()),
            audit,
            effects,
        }
    }

    pub(crate) fn insert(&self, capsule: TimeCapsule, content_key: Zeroizing<[u8; KEY_LEN]>) {
        self.copies.write().insert(
            capsule.id(),
            LocalCopy {
                capsule,
                content_key: Some(content_key),
                shredded_at_ms: None,
            },
        );
    }

    /// Local copy of a capsule
    pub fn get(&self, id: &CapsuleId) -> Option<TimeCapsule> {
        self.copies.read().get(id).map(|copy| copy.capsule.clone())
    }

    /// Number of capsules held, shredded ones included
    pub fn len(&self) -> usize {
        self.copies.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.copies.read().is_empty()
    }

    /// Whether the capsule is held with its content key
    pub fn is_live(&self, id: &CapsuleId) -> bool {
        self.copies
            .read()
            .get(id)
            .is_some_and(|copy| copy.content_key.is_some())
    }

    /// Whether the capsule's content key is gone
    pub fn is_shredded(&self, id: &CapsuleId) -> bool {
        self.copies
            .read()
            .get(id)
            .is_some_and(|copy| copy.content_key.is_none())
    }

    /// Decrypt the local copy; fails once the TTL has passed
    pub fn decrypt_local(&self, id: &CapsuleId) -> Result<Vec<u8>> {
        let copies = self.copies.read();
        let copy = copies
            .get(id)
            .ok_or_else(|| NodeError::not_found(format!("capsule {id}")))?;
        let now = self.effects.now_ms();
        let key = match &copy.content_key {
            Some(key) if !copy.capsule.is_expired(now) => key,
            _ => {
                self.audit.append(
                    AuditRecord::new(AuditEventType::TtlExpired).with("capsule_id", id),
                )?;
                return Err(NodeError::ttl_expired(format!("capsule {id} expired")));
            }
        };
        let capsule = &copy.capsule;
        aead::open(
            key,
            &capsule.payload.nonce,
            &payload_aad(&capsule.header.capsule_id, &capsule.contract_id),
            &capsule.payload.ciphertext,
        )
    }

    /// Shred the content key and ciphertext of every capsule expired at `now_ms`;
    /// returns how many were shredded
    pub fn process_expired(&self, now_ms: u64) -> Result<usize> {
        let mut shredded = Vec::new();
        {
            let mut copies = self.copies.write();
            for (id, copy) in copies.iter_mut() {
                if copy.capsule.is_expired(now_ms) && copy.content_key.take().is_some() {
                    copy.capsule.payload.ciphertext.clear();
                    copy.shredded_at_ms = Some(now_ms);
                    shredded.push(*id);
                }
            }
        }
        for id in &shredded {
            info!(capsule_id = %id, "capsule content key shredded");
            self.audit.append(
                AuditRecord::new(AuditEventType::CryptoShred)
                    .with("capsule_id", id)
                    .with("reason", "ttl"),
            )?;
        }
        Ok(shredded.len())
    }

    /// Forget tombstones shredded at least `retention_ms` before `now_ms`;
    /// returns how many were dropped
    pub fn prune_tombstones(&self, now_ms: u64, retention_ms: u64) -> usize {
        let mut copies = self.copies.write();
        let before = copies.len();
        copies.retain(|_, copy| {
            copy.shredded_at_ms
                .map_or(true, |at| now_ms < at.saturating_add(retention_ms))
        });
        let pruned = before - copies.len();
        if pruned > 0 {
            debug!(pruned, "capsule tombstones pruned");
        }
        pruned
    }
}

impl std::fmt::Debug for CapsuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleStore")
            .field("capsules", &self.len())
            .finish_non_exhaustive()
    }
}
