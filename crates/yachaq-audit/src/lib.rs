//! # YACHAQ Audit - Layer 2: Tamper-Evident Audit Log
//!
//! **Purpose**: Append-only record of every security-relevant decision the node makes.
//!
//! Each entry hashes its canonical data together with the previous entry's hash, so
//! modification, deletion or reordering breaks the chain. The log implements the core
//! [`AuditSink`](yachaq_core::AuditSink) interface, which is the only write path;
//! reads happen through [`AuditLog::export`] and [`verify_chain`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Entries and chain verification
pub mod entry;

/// The audit log and its export
pub mod log;

/// Backing stores
pub mod store;

pub use entry::{verify_chain, AuditEntry, ChainVerification};
pub use log::{AuditExport, AuditLog, ExportedEntry};
pub use store::{read_chain_file, AuditStore, FileAuditStore, MemoryAuditStore};
