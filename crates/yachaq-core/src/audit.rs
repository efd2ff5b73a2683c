//! Append-only audit interface
//!
//! Every module writes security-relevant events through an injected [`AuditSink`].
//! The sink is one-way: nothing in the runtime reads entries back except the
//! dedicated export/verify path in `yachaq-audit`.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds of audited events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Runtime context created
    RuntimeStarted,
    /// Runtime context torn down
    RuntimeStopped,
    /// A request passed inbox validation
    RequestReceived,
    /// A request failed signature, stamp or structure checks
    RequestRejected,
    /// A request reused a nonce or id, or was stale
    ReplayDetected,
    /// A matching request was suppressed because its cohort was below k-min
    BelowKMin,
    /// An offer was surfaced to the user
    OfferSurfaced,
    /// A contract became dual-signed and active
    ConsentSigned,
    /// A contract was revoked
    ContractRevoked,
    /// A plan passed static validation
    PlanValidated,
    /// A plan failed static validation
    PlanRejected,
    /// A plan ran to completion
    PlanExecuted,
    /// A plan run was cancelled
    ExecutionCancelled,
    /// A plan run breached a resource ceiling
    ResourceExceeded,
    /// A capsule was sealed
    CapsuleCreated,
    /// A capsule delivery was confirmed by a signed receipt
    CapsuleDelivered,
    /// A transfer was cancelled or failed before confirmation
    TransferAborted,
    /// Access attempted after TTL
    TtlExpired,
    /// A key was destroyed
    CryptoShred,
    /// The vault master key was rotated
    KeyRotated,
    /// A vault read was refused
    VaultAccessDenied,
    /// Egress was blocked by the network gate
    NetworkGateDenied,
    /// A hash or signature check failed
    IntegrityFailure,
    /// The ODX schema scanner rejected an entry
    SchemaViolation,
    /// A connector sync completed
    ConnectorSynced,
}

impl AuditEventType {
    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeStarted => "runtime_started",
            Self::RuntimeStopped => "runtime_stopped",
            Self::RequestReceived => "request_received",
            Self::RequestRejected => "request_rejected",
            Self::ReplayDetected => "replay_detected",
            Self::BelowKMin => "below_k_min",
            Self::OfferSurfaced => "offer_surfaced",
            Self::ConsentSigned => "consent_signed",
            Self::ContractRevoked => "contract_revoked",
            Self::PlanValidated => "plan_validated",
            Self::PlanRejected => "plan_rejected",
            Self::PlanExecuted => "plan_executed",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::ResourceExceeded => "resource_exceeded",
            Self::CapsuleCreated => "capsule_created",
            Self::CapsuleDelivered => "capsule_delivered",
            Self::TransferAborted => "transfer_aborted",
            Self::TtlExpired => "ttl_expired",
            Self::CryptoShred => "crypto_shred",
            Self::KeyRotated => "key_rotated",
            Self::VaultAccessDenied => "vault_access_denied",
            Self::NetworkGateDenied => "network_gate_denied",
            Self::IntegrityFailure => "integrity_failure",
            Self::SchemaViolation => "schema_violation",
            Self::ConnectorSynced => "connector_synced",
        }
    }

    /// Plain-language description for the device owner
    pub fn describe(self) -> &'static str {
        match self {
            Self::RuntimeStarted => "Your node started.",
            Self::RuntimeStopped => "Your node shut down.",
            Self::RequestReceived => "A data request arrived and passed its checks.",
            Self::RequestRejected => "A data request was rejected because it was not properly signed or formed.",
            Self::ReplayDetected => "A repeated or stale data request was blocked.",
            Self::BelowKMin => "A request was hidden because too few records match to keep you anonymous.",
            Self::OfferSurfaced => "A data request matched and was shown to you.",
            Self::ConsentSigned => "You and the requester both signed an agreement.",
            Self::ContractRevoked => "An agreement was revoked.",
            Self::PlanValidated => "A computation plan was checked against your agreement.",
            Self::PlanRejected => "A computation plan was refused before touching your data.",
            Self::PlanExecuted => "An approved computation ran on your device.",
            Self::ExecutionCancelled => "A computation was cancelled; nothing was shared.",
            Self::ResourceExceeded => "A computation was stopped for using too many resources; nothing was shared.",
            Self::CapsuleCreated => "An encrypted result package was created for the requester.",
            Self::CapsuleDelivered => "The requester confirmed receipt of the encrypted result.",
            Self::TransferAborted => "A delivery was interrupted before it was confirmed.",
            Self::TtlExpired => "Expired data was accessed and the access was refused.",
            Self::CryptoShred => "A key was destroyed so the data it protected can no longer be read.",
            Self::KeyRotated => "Your vault encryption key was rotated.",
            Self::VaultAccessDenied => "A component without permission tried to read your vault.",
            Self::NetworkGateDenied => "An outbound connection was blocked.",
            Self::IntegrityFailure => "A tampered or mis-signed item was rejected.",
            Self::SchemaViolation => "A discovery entry that could reveal personal details was dropped.",
            Self::ConnectorSynced => "New data was imported from a connected source.",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event to append. References hold ids and reasons, never payload content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// What happened
    pub event_type: AuditEventType,
    /// Related identifiers (`request_id`, `contract_id`, `reason`, ...)
    pub references: BTreeMap<String, String>,
}

impl AuditRecord {
    /// Record with no references
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            references: BTreeMap::new(),
        }
    }

    /// Attach a reference
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.references.insert(key.into(), value.to_string());
        self
    }
}

/// One-way, append-only audit interface
pub trait AuditSink: Send + Sync {
    /// Append a record to the tamper-evident chain
    fn append(&self, record: AuditRecord) -> Result<()>;
}
