//! Canonical serialization
//!
//! Values are routed through `serde_json::Value`, whose maps are ordered, so the
//! encoding is independent of field and map insertion order and carries no
//! insignificant whitespace. Anything that is hashed or signed goes through here.
//! Non-finite floats encode as `null`; callers that hash floats reject them first.

use crate::{NodeError, Result};
use serde::Serialize;

/// Canonical JSON bytes of `value`
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let tree = serde_json::to_value(value)
        .map_err(|e| NodeError::serialization(format!("canonical encode failed: {e}")))?;
    serde_json::to_vec(&tree)
        .map_err(|e| NodeError::serialization(format!("canonical encode failed: {e}")))
}

/// Canonical JSON text of `value`
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = to_canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|e| NodeError::serialization(e.to_string()))
}
