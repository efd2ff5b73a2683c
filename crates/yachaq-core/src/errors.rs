//! Unified error system for the node runtime
//!
//! A single error type shared by every crate. The first seven variants are the
//! security taxonomy surfaced to callers; the rest cover supporting failures.

use serde::{Deserialize, Serialize};

/// Unified error type for all node runtime operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum NodeError {
    /// Malformed or out-of-scope plan or request, rejected before any side effect
    #[error("Validation error: {message}")]
    Validation {
        /// What failed validation
        message: String,
    },

    /// Vault ACL violation or other capability failure
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Error message describing the denied access
        message: String,
    },

    /// A VM resource ceiling was breached
    #[error("Resource exceeded ({resource}): {message}")]
    ResourceExceeded {
        /// Which ceiling was breached (cpu, memory, wall_clock, battery, output)
        resource: String,
        /// Error message with the observed usage
        message: String,
    },

    /// Nonce or request id reuse, or a stale request
    #[error("Replay detected: {message}")]
    ReplayDetected {
        /// Error message describing the replay
        message: String,
    },

    /// Outbound call blocked by the network gate
    #[error("Network gate denied: {message}")]
    NetworkGateDenied {
        /// Error message describing why egress was blocked
        message: String,
    },

    /// Hash or signature mismatch on a capsule, contract, plan or audit chain
    #[error("Integrity failure: {message}")]
    IntegrityFailure {
        /// Error message describing the mismatch
        message: String,
    },

    /// Access attempted after a TTL elapsed
    #[error("TTL expired: {message}")]
    TtlExpired {
        /// Error message naming the expired artifact
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Cryptographic primitive failure
    #[error("Crypto error: {message}")]
    Crypto {
        /// Error message describing the cryptographic failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Storage operation failed
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Operation cancelled at a cooperative checkpoint
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Where the cancellation was observed
        message: String,
    },

    /// Device constraints (battery, thermal, network) not met; retry later
    #[error("Deferred: {message}")]
    Deferred {
        /// Which constraint was not met
        message: String,
    },

    /// Transient connector or network failure; retry with backoff
    #[error("Transient failure: {message}")]
    Transient {
        /// Error message describing the transient failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl NodeError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an access denied error
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Create a resource exceeded error
    pub fn resource_exceeded(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExceeded {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a replay detected error
    pub fn replay(message: impl Into<String>) -> Self {
        Self::ReplayDetected {
            message: message.into(),
        }
    }

    /// Create a network gate denial
    pub fn gate_denied(message: impl Into<String>) -> Self {
        Self::NetworkGateDenied {
            message: message.into(),
        }
    }

    /// Create an integrity failure
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            message: message.into(),
        }
    }

    /// Create a TTL expired error
    pub fn ttl_expired(message: impl Into<String>) -> Self {
        Self::TtlExpired {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a deferred error
    pub fn deferred(message: impl Into<String>) -> Self {
        Self::Deferred {
            message: message.into(),
        }
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failure may be retried with backoff.
    ///
    /// Cryptographic, replay and integrity failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Deferred { .. })
    }

    /// Whether the failure must always be written to the audit log.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied { .. }
                | Self::ReplayDetected { .. }
                | Self::NetworkGateDenied { .. }
                | Self::IntegrityFailure { .. }
                | Self::TtlExpired { .. }
                | Self::ResourceExceeded { .. }
                | Self::Crypto { .. }
        )
    }

    /// Stable snake_case name of the variant, used in audit references
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::AccessDenied { .. } => "access_denied",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::ReplayDetected { .. } => "replay_detected",
            Self::NetworkGateDenied { .. } => "network_gate_denied",
            Self::IntegrityFailure { .. } => "integrity_failure",
            Self::TtlExpired { .. } => "ttl_expired",
            Self::NotFound { .. } => "not_found",
            Self::Crypto { .. } => "crypto",
            Self::Serialization { .. } => "serialization",
            Self::Storage { .. } => "storage",
            Self::Cancelled { .. } => "cancelled",
            Self::Deferred { .. } => "deferred",
            Self::Transient { .. } => "transient",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Standard Result type for node runtime operations
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::access_denied(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
