//! Binary framing for handshake and session messages

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use yachaq_core::{NodeError, Result};

/// Largest frame a peer may send
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_BYTES as u64)
}

/// Encode a wire message
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    options()
        .serialize(message)
        .map_err(|e| NodeError::serialization(format!("wire encode: {e}")))
}

/// Decode a wire message; length prefixes are bounded by [`MAX_FRAME_BYTES`]
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(NodeError::resource_exceeded(
            "frame",
            format!("{} byte frame exceeds {MAX_FRAME_BYTES}", frame.len()),
        ));
    }
    options()
        .deserialize(frame)
        .map_err(|e| NodeError::validation(format!("malformed frame: {e}")))
}
