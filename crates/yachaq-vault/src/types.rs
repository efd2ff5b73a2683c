//! Vault data types

use serde::{Deserialize, Serialize};
use std::fmt;
use yachaq_core::RawRef;
use yachaq_crypto::Digest;

/// Module asking the vault for plaintext
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaultCaller {
    /// Feature extraction during ingest
    FeatureExtractor,
    /// Query plan interpreter
    QueryPlanVm,
    /// Connector sync (write-only)
    Connector,
    /// Anything else, by name
    Other(String),
}

impl VaultCaller {
    /// Callers permitted to decrypt objects
    pub const READ_ALLOWLIST: [VaultCaller; 2] =
        [VaultCaller::FeatureExtractor, VaultCaller::QueryPlanVm];

    /// Whether this caller may read plaintext
    pub fn may_read(&self) -> bool {
        Self::READ_ALLOWLIST.contains(self)
    }
}

impl fmt::Display for VaultCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureExtractor => f.write_str("feature_extractor"),
            Self::QueryPlanVm => f.write_str("query_plan_vm"),
            Self::Connector => f.write_str("connector"),
            Self::Other(name) => write!(f, "other:{name}"),
        }
    }
}

/// A raw record handed to the vault by a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    /// Connector or import source (`"strava"`, `"health_connect"`)
    pub source: String,
    /// Record type (`"trip"`, `"steps"`)
    pub record_type: String,
    /// Raw bytes, usually JSON
    pub data: Vec<u8>,
    /// Optional lifetime in milliseconds from ingestion
    pub ttl_ms: Option<u64>,
}

impl RawItem {
    /// Item without a TTL
    pub fn new(source: impl Into<String>, record_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            record_type: record_type.into(),
            data,
            ttl_ms: None,
        }
    }

    /// Set a TTL
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Metadata readable without decryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Source that produced the object
    pub source: String,
    /// Record type
    pub record_type: String,
    /// Plaintext length in bytes
    pub original_size: u64,
    /// SHA-256 of the plaintext
    pub checksum: Digest,
}

/// DEK encrypted under a master key version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// AES-GCM nonce
    pub nonce: [u8; 12],
    /// Encrypted DEK with tag
    pub ciphertext: Vec<u8>,
}

/// Stored vault object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultObject {
    /// Reference handed out at ingestion
    pub raw_ref: RawRef,
    /// Encrypted content
    #[serde(skip)]
    pub ciphertext: Vec<u8>,
    /// Content nonce
    pub nonce: [u8; 12],
    /// Wrapped DEK; `None` once crypto-shredded
    pub wrapped_dek: Option<WrappedKey>,
    /// Master key version that wraps the DEK
    pub key_version: u32,
    /// Ingestion time
    pub created_at_ms: u64,
    /// Expiry time, if any
    pub expires_at_ms: Option<u64>,
    /// Plaintext-free metadata
    pub metadata: ObjectMetadata,
}

impl VaultObject {
    /// Whether the DEK is gone
    pub fn is_shredded(&self) -> bool {
        self.wrapped_dek.is_none()
    }

    /// Whether the object is past its TTL at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Vault counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStats {
    /// Live (non-shredded) objects
    pub objects: usize,
    /// Objects whose key has been destroyed
    pub shredded: usize,
    /// Successful plaintext reads
    pub reads: u64,
    /// Refused reads
    pub denials: u64,
    /// Objects written
    pub writes: u64,
    /// Current master key version
    pub key_version: u32,
}
