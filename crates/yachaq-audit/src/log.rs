//! The on-device audit log

use crate::entry::{verify_chain, AuditEntry, ChainVerification};
use crate::store::{AuditStore, MemoryAuditStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use yachaq_core::{AuditEventType, AuditRecord, AuditSink, Effects, NodeError, Result};
use yachaq_crypto::Digest;

struct ChainHead {
    next_seq: u64,
    last_hash: Digest,
}

/// Hash-chained, append-only audit log.
///
/// Appends are serialized under one lock so sequence numbers and links are
/// assigned in a single total order.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    head: Mutex<ChainHead>,
    effects: Effects,
}

impl AuditLog {
    /// Log backed by memory
    pub fn in_memory(effects: Effects) -> Self {
        Self {
            store: Arc::new(MemoryAuditStore::new()),
            head: Mutex::new(ChainHead {
                next_seq: 0,
                last_hash: Digest::ZERO,
            }),
            effects,
        }
    }

    /// Resume a log from `store`. Refuses to continue a chain that fails
    /// verification.
    pub fn open(store: Arc<dyn AuditStore>, effects: Effects) -> Result<Self> {
        let existing = store.load_all()?;
        let report = verify_chain(&existing);
        if !report.is_valid() {
            return Err(NodeError::integrity(format!(
                "audit chain is corrupt: {}",
                report.errors.join("; ")
            )));
        }
        let head = ChainHead {
            next_seq: existing.len() as u64,
            last_hash: existing.last().map(|e| e.hash).unwrap_or(Digest::ZERO),
        };
        tracing::debug!(entries = existing.len(), "Opened audit log");
        Ok(Self {
            store,
            head: Mutex::new(head),
            effects,
        })
    }

    /// Number of entries appended so far
    pub fn len(&self) -> u64 {
        self.head.lock().next_seq
    }

    /// Whether nothing has been logged
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of the newest entry
    pub fn head_hash(&self) -> Digest {
        self.head.lock().last_hash
    }

    /// Append and return the sealed entry
    pub fn record(&self, record: AuditRecord) -> Result<AuditEntry> {
        let mut head = self.head.lock();
        let entry = AuditEntry::new(
            head.next_seq,
            record.event_type,
            self.effects.now_ms(),
            record.references,
            head.last_hash,
        )?;
        self.store.append(&entry)?;
        head.next_seq += 1;
        head.last_hash = entry.hash;
        tracing::debug!(
            seq = entry.seq,
            event = %entry.event_type,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Portable export with plain-language descriptions
    pub fn export(&self) -> Result<AuditExport> {
        // Hold the head lock so the snapshot is a prefix-consistent chain.
        let head = self.head.lock();
        let entries = self.store.load_all()?;
        Ok(AuditExport {
            format_version: AuditExport::FORMAT_VERSION,
            exported_at_ms: self.effects.now_ms(),
            head_hash: head.last_hash,
            entries: entries
                .into_iter()
                .map(|entry| ExportedEntry {
                    description: entry.event_type.describe().to_string(),
                    entry,
                })
                .collect(),
        })
    }

    /// Verify the stored chain
    pub fn verify(&self) -> Result<ChainVerification> {
        Ok(verify_chain(&self.store.load_all()?))
    }
}

impl AuditSink for AuditLog {
    fn append(&self, record: AuditRecord) -> Result<()> {
        self.record(record).map(|_| ())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Exported entry with its owner-facing description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedEntry {
    /// The chained entry
    #[serde(flatten)]
    pub entry: AuditEntry,
    /// Plain-language description
    pub description: String,
}

/// Portable audit export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditExport {
    /// Export format version
    pub format_version: u32,
    /// When the export was taken
    pub exported_at_ms: u64,
    /// Hash of the newest entry at export time
    pub head_hash: Digest,
    /// Entries in chain order
    pub entries: Vec<ExportedEntry>,
}

impl AuditExport {
    /// Current export format
    pub const FORMAT_VERSION: u32 = 1;

    /// Verify the exported chain and that it ends at `head_hash`
    pub fn verify(&self) -> ChainVerification {
        let entries: Vec<AuditEntry> = self.entries.iter().map(|e| e.entry.clone()).collect();
        let mut report = verify_chain(&entries);
        let tail = entries.last().map(|e| e.hash).unwrap_or(Digest::ZERO);
        if tail != self.head_hash {
            report
                .errors
                .push("export head hash does not match last entry".to_string());
        }
        report
    }

    /// Event types in chain order
    pub fn event_types(&self) -> Vec<AuditEventType> {
        self.entries.iter().map(|e| e.entry.event_type).collect()
    }

    /// Entries of one type
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<&AuditEntry> {
        self.entries
            .iter()
            .map(|e| &e.entry)
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Serialize as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileAuditStore;
    use assert_matches::assert_matches;

    #[test]
    fn test_append_links_entries() {
        let (effects, clock) = Effects::deterministic(1, 10_000);
        let log = AuditLog::in_memory(effects);
        let first = log
            .record(AuditRecord::new(AuditEventType::RequestReceived).with("request_id", "r1"))
            .unwrap();
        clock.advance_ms(5);
        let second = log
            .record(AuditRecord::new(AuditEventType::ConsentSigned))
            .unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(first.prev_hash, Digest::ZERO);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.timestamp_ms, 10_005);
        assert!(log.verify().unwrap().is_valid());
    }

    #[test]
    fn test_export_has_descriptions_and_verifies() {
        let (effects, _) = Effects::deterministic(2, 0);
        let log = AuditLog::in_memory(effects);
        log.append(AuditRecord::new(AuditEventType::CapsuleCreated))
            .unwrap();
        log.append(AuditRecord::new(AuditEventType::TtlExpired))
            .unwrap();

        let export = log.export().unwrap();
        assert_eq!(
            export.event_types(),
            vec![AuditEventType::CapsuleCreated, AuditEventType::TtlExpired]
        );
        assert!(!export.entries[0].description.is_empty());
        assert!(export.verify().is_valid());

        let json = export.to_json().unwrap();
        let parsed: AuditExport = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify().is_valid());
    }

    #[test]
    fn test_export_detects_truncated_tail() {
        let (effects, _) = Effects::deterministic(3, 0);
        let log = AuditLog::in_memory(effects);
        for _ in 0..3 {
            log.append(AuditRecord::new(AuditEventType::PlanExecuted))
                .unwrap();
        }
        let mut export = log.export().unwrap();
        export.entries.pop();
        assert!(!export.verify().is_valid());
    }

    #[test]
    fn test_file_store_reload_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let (effects, _) = Effects::deterministic(4, 0);

        {
            let store = Arc::new(FileAuditStore::open(&path).unwrap());
            let log = AuditLog::open(store, effects.clone()).unwrap();
            log.append(AuditRecord::new(AuditEventType::RuntimeStarted))
                .unwrap();
            log.append(AuditRecord::new(AuditEventType::RuntimeStopped))
                .unwrap();
        }

        let store = Arc::new(FileAuditStore::open(&path).unwrap());
        let log = AuditLog::open(store, effects).unwrap();
        assert_eq!(log.len(), 2);
        let third = log
            .record(AuditRecord::new(AuditEventType::RuntimeStarted))
            .unwrap();
        assert_eq!(third.seq, 2);
        assert!(log.verify().unwrap().is_valid());
    }

    #[test]
    fn test_open_refuses_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let (effects, _) = Effects::deterministic(5, 0);
        {
            let store = Arc::new(FileAuditStore::open(&path).unwrap());
            let log = AuditLog::open(store, effects.clone()).unwrap();
            log.append(AuditRecord::new(AuditEventType::ConsentSigned).with("contract_id", "c1"))
                .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("c1", "c2")).unwrap();

        let store = Arc::new(FileAuditStore::open(&path).unwrap());
        assert_matches!(
            AuditLog::open(store, effects),
            Err(NodeError::IntegrityFailure { .. })
        );
    }
}
