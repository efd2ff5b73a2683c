//! # YACHAQ Transport - Layer 4: Peer-to-Peer Delivery
//!
//! **Purpose**: Move sealed capsules from the device to one requester over an
//! authenticated, forward-secret channel, with every outbound byte cleared by
//! the network gate.
//!
//! A delivery runs in three stages:
//! - **Handshake**: ephemeral X25519 plus Ed25519 transcript signatures; the
//!   device signs with its pairwise key for the requester
//! - **Session**: ChaCha20-Poly1305 frames bound to a strict counter
//! - **Transfer**: manifest, hashed chunks, cumulative acks, signed receipt;
//!   an interrupted transfer resumes on a new session
//!
//! # Architecture Constraints
//!
//! - YES default-deny egress; destinations are registered with a payload class
//! - YES the relay sees only opaque frames
//! - NO plaintext payload class exists
//! - NO retry of integrity or replay failures

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Async handshake and transfer drivers
pub mod delivery;

/// Egress allowlist and payload inspection
pub mod gate;

/// Authenticated key exchange
pub mod handshake;

/// Frame links
pub mod link;

/// Rendezvous relay
pub mod relay;

/// Established sessions
pub mod session;

/// Chunked transfer and receipts
pub mod transfer;

/// Message framing
pub mod wire;

pub use delivery::{accept, initiate, CapsuleReceiver, CapsuleSender};
pub use gate::{
    normalize_domain, shannon_entropy, BlockedAttempt, DenialReason, GateStats, NetworkGate,
    Outbound, PayloadClass, Registration,
};
pub use handshake::{
    HandshakeFinish, HandshakeInit, HandshakeResponse, Initiator, PairwiseSigner, PeerSigner,
    Responder,
};
pub use link::{FrameLink, GatedLink, MemoryLink};
pub use relay::{Relay, RelayLink, RelayStats, SignalingRecord};
pub use session::{Role, SecureSession};
pub use transfer::{
    DeliveryReceipt, IncomingTransfer, OutgoingTransfer, ReceiptStatus, TransferManifest,
    TransferMessage,
};
