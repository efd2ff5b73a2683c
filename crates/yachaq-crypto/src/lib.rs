//! # YACHAQ Crypto - Layer 2: Cryptographic Primitives
//!
//! **Purpose**: Every key, signature, hash and cipher the node runtime touches.
//!
//! # Architecture Constraints
//!
//! **Layer 2 depends only on yachaq-core.**
//! - YES Ed25519 identities (root and pairwise) owned by the [`KeyRing`]
//! - YES X25519 agreement and anonymous sealed boxes
//! - YES ChaCha20-Poly1305 / AES-256-GCM helpers, HKDF, SHA-256, BLAKE3 sealing
//! - NO storage layout, protocol state or audit policy (higher layers)
//!
//! Errors are reported through [`yachaq_core::NodeError`]; any signature, tag or
//! hash mismatch is an `IntegrityFailure`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// AEAD and key derivation helpers
pub mod aead;

/// X25519 key agreement
pub mod agreement;

/// Hashing helpers
pub mod hash;

/// Device identity and key management
pub mod keyring;

/// Sealed boxes to an X25519 recipient
pub mod sealed_box;

/// Sealing for data at rest
pub mod sealing;

/// Ed25519 signatures
pub mod signature;

/// Fixed-size byte types
pub mod types;

pub use agreement::AgreementSecret;
pub use hash::{ct_eq, sha256, sha256_parts};
pub use keyring::{KeyRing, MemoryKeyStore, SecureKeyStore};
pub use sealed_box::SealedBox;
pub use sealing::SealedData;
pub use signature::{verify_signature, SigningIdentity};
pub use types::{AgreementPublicKey, Digest, PublicKey, SignatureBytes};
