//! # YACHAQ ODX - Layer 4: On-Device Discovery Index
//!
//! **Purpose**: Publish coarse label counts that requests can match against,
//! never below the privacy floor.
//!
//! Observations roll up a fixed ladder of time and geo resolutions until they
//! meet `k_min`; what never does is suppressed. A schema scanner checks every
//! entry before it becomes visible.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Index builder and queries
pub mod builder;

/// Entry types
pub mod entry;

/// Snapshot persistence
pub mod persistence;

/// Schema scanner
pub mod scanner;

pub use builder::{Cohort, OdxBuilder, OdxCriteria, OdxStats, UpsertOutcome, LADDER};
pub use entry::{Aggregate, EntryKey, OdxEntry, Quality};
pub use scanner::{SchemaScanner, Violation};
