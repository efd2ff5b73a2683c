//! # YACHAQ Testkit
//!
//! Simulated collaborators and seeded data for integration tests: a requester
//! that signs requests and plans and opens capsules, a policy authority that
//! stamps requests, and trip fixtures with a known weekly average.
//!
//! ```toml
//! [dev-dependencies]
//! yachaq-testkit = { path = "../yachaq-testkit" }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Policy authority simulator
pub mod authority;

/// Trip data and plan fixtures
pub mod fixtures;

/// Requester simulator
pub mod requester;

pub use authority::PolicyAuthority;
pub use fixtures::{
    seed_trips, test_effects, trip_item, trip_scope, trip_start, weekly_trip_steps, HOUR_MS, T0,
};
pub use requester::RequesterSim;
