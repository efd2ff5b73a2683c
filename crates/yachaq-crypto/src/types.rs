//! Fixed-size byte types with hex encoding
//!
//! Keys, signatures and digests appear inside signed and hashed structures, so they
//! serialize as lowercase hex strings to keep canonical JSON readable and stable.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use yachaq_core::{NodeError, Result};

macro_rules! hex_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Byte length
            pub const LEN: usize = $len;

            /// Lowercase hex encoding
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse lowercase or uppercase hex
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| NodeError::validation(format!("invalid hex: {e}")))?;
                Self::from_slice(&bytes)
            }

            /// Copy from a slice of the exact length
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    NodeError::validation(format!(
                        "expected {} bytes, got {}",
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            /// Borrow the bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_hex(&text).map_err(de::Error::custom)
            }
        }
    };
}

hex_bytes!(
    /// Ed25519 verifying key bytes
    PublicKey,
    32
);
hex_bytes!(
    /// X25519 public key bytes
    AgreementPublicKey,
    32
);
hex_bytes!(
    /// Ed25519 signature bytes
    SignatureBytes,
    64
);
hex_bytes!(
    /// SHA-256 digest
    Digest,
    32
);

impl PublicKey {
    /// Short fingerprint: first 8 bytes of SHA-256, hex
    pub fn fingerprint(&self) -> String {
        crate::hash::sha256(&self.0).to_hex()[..16].to_string()
    }
}

impl AgreementPublicKey {
    /// Short fingerprint: first 8 bytes of SHA-256, hex
    pub fn fingerprint(&self) -> String {
        crate::hash::sha256(&self.0).to_hex()[..16].to_string()
    }
}

impl Digest {
    /// All-zero digest used as the genesis link of hash chains
    pub const ZERO: Digest = Digest([0u8; 32]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_serde_roundtrip() {
        let key = PublicKey([7u8; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(32)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(SignatureBytes::from_hex("abcd").is_err());
        assert!(Digest::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_fingerprint_length() {
        assert_eq!(PublicKey([1u8; 32]).fingerprint().len(), 16);
    }
}
