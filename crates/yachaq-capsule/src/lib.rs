//! # YACHAQ Capsule - Layer 4: Time Capsules
//!
//! **Purpose**: Seal plan output for exactly one requester, sign it with the
//! device's pairwise key and bound its life with a TTL.
//!
//! The payload is encrypted under a fresh content key; that key is sealed to
//! the requester's X25519 key from the contract. The device keeps its own
//! copy in a [`CapsuleStore`] until the TTL passes, then destroys the key.
//!
//! # Architecture Constraints
//!
//! - YES every capsule is bound to one contract, one plan and one requester
//! - YES integrity failures are reported before expiry
//! - NO decryption of a local copy once the TTL has passed

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Capsule format and verification
pub mod capsule;

/// Requester-side opening
pub mod opener;

/// Packing VM output
pub mod packager;

/// Local copies and crypto-shredding
pub mod store;

pub use capsule::{
    capsule_hash, signing_message, CapsuleHeader, CapsuleProofs, CapsuleSummary,
    EncryptedPayload, TimeCapsule, CAPSULE_SCHEMA_VERSION, PAYLOAD_ALGORITHM,
};
pub use opener::CapsuleOpener;
pub use packager::CapsulePackager;
pub use store::CapsuleStore;
