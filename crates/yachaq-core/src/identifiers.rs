//! Identifier newtypes
//!
//! UUID-backed ids are generated through [`Effects`](crate::Effects) so seeded runs
//! produce the same ids.

use crate::{Effects, NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Fresh id from the injected RNG
            pub fn generate(effects: &Effects) -> Self {
                Self(effects.random_uuid())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Raw UUID bytes
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

uuid_id!(
    /// Inbound data request
    RequestId,
    "req"
);
uuid_id!(
    /// Consent contract
    ContractId,
    "contract"
);
uuid_id!(
    /// Query plan
    PlanId,
    "plan"
);
uuid_id!(
    /// Time capsule
    CapsuleId,
    "capsule"
);
uuid_id!(
    /// P2P transfer
    TransferId,
    "transfer"
);

/// Opaque reference to a vault object, rendered as `vault:<uuid>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RawRef(Uuid);

impl RawRef {
    /// Prefix shared by every raw reference
    pub const PREFIX: &'static str = "vault:";

    /// Fresh reference from the injected RNG
    pub fn generate(effects: &Effects) -> Self {
        Self(effects.random_uuid())
    }

    /// Underlying object id
    pub fn object_id(&self) -> Uuid {
        self.0
    }

    /// Parse `vault:<uuid>`
    pub fn parse(s: &str) -> Result<Self> {
        let id = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| NodeError::validation(format!("raw_ref must start with vault: ({s})")))?;
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|e| NodeError::validation(format!("invalid raw_ref {s}: {e}")))
    }
}

impl fmt::Display for RawRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl TryFrom<String> for RawRef {
    type Error = NodeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RawRef> for String {
    fn from(value: RawRef) -> Self {
        value.to_string()
    }
}

/// Short public fingerprint of a node's root key (16 hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_ref_roundtrip() {
        let (effects, _) = Effects::deterministic(11, 0);
        let raw_ref = RawRef::generate(&effects);
        let text = raw_ref.to_string();
        assert!(text.starts_with("vault:"));
        assert_eq!(RawRef::parse(&text).unwrap(), raw_ref);
    }

    #[test]
    fn test_raw_ref_rejects_foreign_prefix() {
        assert!(RawRef::parse("file:/etc/passwd").is_err());
        assert!(RawRef::parse("vault:not-a-uuid").is_err());
    }

    #[test]
    fn test_ids_are_seed_stable() {
        let (a, _) = Effects::deterministic(5, 0);
        let (b, _) = Effects::deterministic(5, 0);
        assert_eq!(ContractId::generate(&a), ContractId::generate(&b));
    }
}
