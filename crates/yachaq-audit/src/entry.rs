//! Audit entries and chain verification

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use yachaq_core::{to_canonical_bytes, AuditEventType, Result};
use yachaq_crypto::{sha256_parts, Digest};

/// One link in the audit chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 0
    pub seq: u64,
    /// What happened
    pub event_type: AuditEventType,
    /// Milliseconds since the UNIX epoch
    pub timestamp_ms: u64,
    /// Related identifiers and reasons
    pub references: BTreeMap<String, String>,
    /// Hash of the previous entry, or zeros for the first
    pub prev_hash: Digest,
    /// `SHA-256(canonical(data) || prev_hash_hex)`
    pub hash: Digest,
}

#[derive(Serialize)]
struct EntryData<'a> {
    seq: u64,
    event_type: AuditEventType,
    timestamp_ms: u64,
    references: &'a BTreeMap<String, String>,
}

impl AuditEntry {
    /// Build an entry linked to `prev_hash`
    pub fn new(
        seq: u64,
        event_type: AuditEventType,
        timestamp_ms: u64,
        references: BTreeMap<String, String>,
        prev_hash: Digest,
    ) -> Result<Self> {
        let hash = compute_hash(seq, event_type, timestamp_ms, &references, &prev_hash)?;
        Ok(Self {
            seq,
            event_type,
            timestamp_ms,
            references,
            prev_hash,
            hash,
        })
    }

    /// Recompute this entry's hash from its contents
    pub fn recompute_hash(&self) -> Result<Digest> {
        compute_hash(
            self.seq,
            self.event_type,
            self.timestamp_ms,
            &self.references,
            &self.prev_hash,
        )
    }
}

fn compute_hash(
    seq: u64,
    event_type: AuditEventType,
    timestamp_ms: u64,
    references: &BTreeMap<String, String>,
    prev_hash: &Digest,
) -> Result<Digest> {
    let data = to_canonical_bytes(&EntryData {
        seq,
        event_type,
        timestamp_ms,
        references,
    })?;
    Ok(sha256_parts(&[&data, prev_hash.to_hex().as_bytes()]))
}

/// Result of walking a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Entries checked
    pub entries_checked: usize,
    /// Human-readable problems; empty when intact
    pub errors: Vec<String>,
}

impl ChainVerification {
    /// Whether the chain is intact
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Walk `entries` from genesis, checking sequence numbers, links and hashes
pub fn verify_chain(entries: &[AuditEntry]) -> ChainVerification {
    let mut errors = Vec::new();
    let mut expected_prev = Digest::ZERO;

    for (index, entry) in entries.iter().enumerate() {
        if entry.seq != index as u64 {
            errors.push(format!(
                "sequence gap at index {index}: found seq {}",
                entry.seq
            ));
        }
        if entry.prev_hash != expected_prev {
            errors.push(format!("previous hash mismatch at index {index}"));
        }
        match entry.recompute_hash() {
            Ok(hash) if hash == entry.hash => {}
            Ok(_) => errors.push(format!("entry hash mismatch at index {index}")),
            Err(e) => errors.push(format!("entry {index} could not be hashed: {e}")),
        }
        expected_prev = entry.hash;
    }

    ChainVerification {
        entries_checked: entries.len(),
        errors,
    }
}
