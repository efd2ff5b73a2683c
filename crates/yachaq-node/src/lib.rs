//! # YACHAQ Node - Layer 6: Runtime
//!
//! **Purpose**: Own every on-device component for the life of the process and
//! drive a data request from arrival to a delivered, signed receipt.
//!
//! [`Runtime`] is built once at boot by [`RuntimeBuilder`] and passed by
//! reference; there are no singletons. Background work is admitted by the
//! [`TaskScheduler`] against device state, plan runs are serialized per
//! contract by the [`ExecutionFence`], and connectors are retried with backoff
//! by [`ConnectorSync`].
//!
//! # Architecture Constraints
//!
//! - YES one explicit context created at boot and torn down at shutdown
//! - YES every state change that matters lands in the audit log
//! - NO plan runs twice, and no contract runs two plans at once
//! - NO lock is held across a connector or network await

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Connector sync and cursor checkpoints
pub mod connector;

/// Scenario run with simulated collaborators
#[cfg(feature = "demo")]
pub mod demo;

/// Per-contract execution fence
pub mod fence;

/// Request-to-receipt flow
pub mod flow;

/// Runtime context and builder
pub mod runtime;

/// Device-state job admission
pub mod scheduler;

/// Background task registry
pub mod tasks;

pub use connector::{Connector, ConnectorSync, SyncBatch, SyncReport};
pub use fence::{ExecutionFence, FenceGuard};
pub use runtime::{Ingested, MaintenanceReport, Runtime, RuntimeBuilder};
pub use scheduler::{JobKind, SchedulerStats, TaskScheduler};
pub use tasks::TaskRegistry;
