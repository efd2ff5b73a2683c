//! # YACHAQ VM - Layer 4: Constrained Query Plan Execution
//!
//! **Purpose**: Run requester-signed query plans over local data without ever
//! executing requester code.
//!
//! A plan is a list of wire steps. Each step must decode into the closed
//! [`Instruction`] set; the [`PlanValidator`] then checks ordering, contract
//! binding and scope before any data is touched. Execution is governed by a
//! [`ResourceGovernor`] and locks network egress for its whole duration.
//!
//! # Architecture Constraints
//!
//! - YES deterministic output for a given data snapshot, contract and plan
//! - YES every validation, execution, cancellation and breach is audited
//! - NO dynamic dispatch over opcodes, no loops, no user-defined functions
//! - NO vault access before static validation passes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Resource governor
pub mod governor;

/// Closed instruction set
pub mod instruction;

/// Signed plans
pub mod plan;

/// Plan preview
pub mod preview;

/// Rows and row sources
pub mod row;

/// Static validation
pub mod validator;

/// Interpreter
pub mod vm;

#[cfg(test)]
mod testing;

pub use governor::{ResourceGovernor, ResourceUsage};
pub use instruction::{AggFn, BucketSpec, FilterOp, Instruction, Opcode};
pub use plan::{PlanBody, PlanStep, QueryPlan};
pub use preview::{PlanPreview, PreviewStep};
pub use row::{event_row, MemoryRowSource, Row, RowSource, VaultRowSource};
pub use validator::{PlanValidator, ValidatedPlan};
pub use vm::{QueryPlanVm, VmOutput};
