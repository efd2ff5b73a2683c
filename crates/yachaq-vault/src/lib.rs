//! # YACHAQ Vault - Layer 3: Local Encrypted Store
//!
//! **Purpose**: Sole custodian of the device owner's raw records.
//!
//! - Envelope encryption: fresh AES-256-GCM DEK per object, wrapped by a versioned
//!   master key
//! - Read allowlist: only the feature extractor and the query plan VM decrypt
//! - Master key rotation re-wraps DEKs without touching ciphertext
//! - Crypto-shredding and TTL purge
//! - Per-object reader/writer locks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Vault error constructors
pub mod error;

mod keys;

/// On-disk persistence
pub mod persistence;

/// Vault data types
pub mod types;

/// The vault
pub mod vault;

pub use error::VaultErrorBuilder;
pub use types::{ObjectMetadata, RawItem, VaultCaller, VaultObject, VaultStats, WrappedKey};
pub use vault::LocalVault;
