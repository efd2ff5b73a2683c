//! Vault error constructors

use yachaq_core::{NodeError, RawRef};

/// Vault-specific error constructors
pub struct VaultErrorBuilder;

impl VaultErrorBuilder {
    /// No object under this reference
    pub fn not_found(raw_ref: &RawRef) -> NodeError {
        NodeError::not_found(format!("vault object not found: {raw_ref}"))
    }

    /// Caller is not on the read allowlist
    pub fn access_denied(caller: impl std::fmt::Display) -> NodeError {
        NodeError::access_denied(format!("vault read denied for caller {caller}"))
    }

    /// Object key was destroyed
    pub fn shredded(raw_ref: &RawRef) -> NodeError {
        NodeError::crypto(format!("vault object {raw_ref} was crypto-shredded"))
    }

    /// Object outlived its TTL
    pub fn expired(raw_ref: &RawRef) -> NodeError {
        NodeError::ttl_expired(format!("vault object {raw_ref} has expired"))
    }

    /// No master key for a stored version
    pub fn missing_key_version(version: u32) -> NodeError {
        NodeError::crypto(format!("no master key for version {version}"))
    }

    /// Stored checksum does not match decrypted content
    pub fn checksum_mismatch(raw_ref: &RawRef) -> NodeError {
        NodeError::integrity(format!("checksum mismatch for vault object {raw_ref}"))
    }
}
