//! # YACHAQ Core - Layer 1: Foundation
//!
//! **Purpose**: Shared vocabulary for the on-device node runtime.
//!
//! # Architecture Constraints
//!
//! **Layer 1 depends on no other workspace crate.**
//! - YES unified error type and result alias
//! - YES injectable effects (time, randomness, device state, cancellation)
//! - YES configuration with policy defaults
//! - YES identifiers, coarse geo cells, calendar buckets
//! - YES canonical serialization for hashing and signing
//! - YES the append-only audit interface
//! - NO cryptography (that's yachaq-crypto)
//! - NO storage or I/O beyond loading configuration

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Append-only audit interface
pub mod audit;

/// Cooperative cancellation
pub mod cancel;

/// Canonical serialization for hashing and signing
pub mod canonical;

/// Node configuration
pub mod config;

/// Device state collaborator interface
pub mod device;

/// Injectable time and randomness
pub mod effects;

/// Network egress lockdown
pub mod egress;

/// Unified error handling
pub mod errors;

/// Coarse geographic cells
pub mod geo;

/// Identifier newtypes
pub mod identifiers;

/// Calendar bucketing
pub mod time;

pub use audit::{AuditEventType, AuditRecord, AuditSink};
pub use cancel::CancellationToken;
pub use canonical::{to_canonical_bytes, to_canonical_string};
pub use config::{
    BackoffConfig, ConfigValidation, JobConstraints, MatchingMode, NodeConfig, ResourceLimits,
};
pub use device::{DeviceState, DeviceStateProvider, NetworkType, StaticDeviceState};
pub use effects::{
    Effects, ManualClock, OsRandom, RandomEffects, SeededRandom, SystemClock, TimeEffects,
};
pub use egress::{EgressGuard, EgressLock};
pub use errors::{NodeError, Result};
pub use geo::{GeoCell, GeoResolution};
pub use identifiers::{CapsuleId, ContractId, NodeId, PlanId, RawRef, RequestId, TransferId};
pub use time::{TimeGranularity, TimeWindow};
