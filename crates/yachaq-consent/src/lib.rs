//! # YACHAQ Consent - Layer 4: Requests, Matching and Contracts
//!
//! **Purpose**: Take signed data requests in, decide locally whether the device
//! qualifies, and turn an accepted offer into a dual-signed contract.
//!
//! # Flow
//!
//! 1. [`RequestInbox::receive`] checks structure, freshness, replay, requester
//!    signature, policy stamp and capacity, in that order.
//! 2. [`LocalMatcher::evaluate`] runs the eligibility [`Predicate`] against the
//!    local ODX. Ineligible requests get no reply.
//! 3. [`ContractDraft`] narrows the scope, [`ContractDraft::ds_sign`] signs with
//!    the pairwise key, and [`SingleSignedContract::countersign`] yields an
//!    immutable [`ActiveContract`].
//!
//! # Architecture Constraints
//!
//! - YES reads the ODX, never the vault
//! - YES every accept, reject and replay is audited
//! - NO network access; offers and contracts are handed to the runtime

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Contract drafting and signing
pub mod contract;

/// Request inbox
pub mod inbox;

/// Local eligibility matching
pub mod matcher;

/// Eligibility predicate language
pub mod predicate;

/// Signed requests and policy stamps
pub mod request;

/// Active contract store
pub mod store;

pub use contract::{
    ActiveContract, ContractDraft, ContractRecord, ContractScope, ContractTerms, Obligation,
    ScopeChoices, SingleSignedContract,
};
pub use inbox::{InboxStats, ReceiveStatus, RequestInbox, RequestStatus};
pub use matcher::{geo_topic, LocalMatcher, MatchOutcome, Offer};
pub use predicate::{CmpOp, FacetSource, Predicate};
pub use request::{
    Compensation, DataRequest, OutputMode, PolicyStamp, RequestBody, RequestScope,
};
pub use store::{ContractStatus, ContractStore};
