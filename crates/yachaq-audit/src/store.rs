//! Audit entry persistence
//!
//! Stores only ever append. The file store writes one JSON object per line and
//! flushes after every append.

use crate::entry::AuditEntry;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use yachaq_core::{NodeError, Result};

/// Append-only backing store for audit entries
pub trait AuditStore: Send + Sync {
    /// Append one entry
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Load every entry in order
    fn load_all(&self) -> Result<Vec<AuditEntry>>;
}

/// Volatile store
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.lock().clone())
    }
}

/// JSON-lines file store
#[derive(Debug)]
pub struct FileAuditStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAuditStore {
    /// Open (creating if needed) the chain file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the chain file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a JSON-lines chain file without opening it for append
pub fn read_chain_file(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
    let file = File::open(path.as_ref())?;
    let mut entries = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
            NodeError::integrity(format!("malformed audit line {}: {e}", line_no + 1))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

impl AuditStore for FileAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEntry>> {
        read_chain_file(&self.path)
    }
}
