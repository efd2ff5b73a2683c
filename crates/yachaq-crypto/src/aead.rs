//! ChaCha20-Poly1305 and HKDF helpers

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use yachaq_core::{NodeError, Result};
use zeroize::Zeroizing;

/// Symmetric key length
pub const KEY_LEN: usize = 32;
/// Nonce length
pub const NONCE_LEN: usize = 12;
/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under `key` with `aad` authenticated
pub fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| NodeError::crypto(format!("ChaCha20-Poly1305 encryption failed: {e}")))
}

/// Decrypt and authenticate. A bad tag is an integrity failure.
pub fn open(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| NodeError::integrity("AEAD authentication failed"))
}

/// HKDF-SHA256 expand into a 32-byte key
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| NodeError::crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// HKDF-SHA256 expand into two independent 32-byte keys
pub fn hkdf_sha256_pair(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
) -> Result<(Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>)> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| NodeError::crypto(format!("HKDF expand failed: {e}")))?;
    let mut first = Zeroizing::new([0u8; KEY_LEN]);
    let mut second = Zeroizing::new([0u8; KEY_LEN]);
    first.copy_from_slice(&okm[..KEY_LEN]);
    second.copy_from_slice(&okm[KEY_LEN..]);
    Ok((first, second))
}

/// 96-bit nonce from a message counter
pub fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [9u8; 32];
        let nonce = counter_nonce(1);
        let ct = seal(&key, &nonce, b"aad", b"chunk").unwrap();
        assert_eq!(ct.len(), 5 + TAG_LEN);
        assert_eq!(open(&key, &nonce, b"aad", &ct).unwrap(), b"chunk");
    }

    #[test]
    fn test_wrong_aad_is_integrity_failure() {
        let key = [9u8; 32];
        let nonce = counter_nonce(1);
        let ct = seal(&key, &nonce, b"transfer|0", b"chunk").unwrap();
        assert!(matches!(
            open(&key, &nonce, b"transfer|1", &ct),
            Err(NodeError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn test_hkdf_pair_keys_differ() {
        let (a, b) = hkdf_sha256_pair(b"salt", b"ikm", b"split").unwrap();
        assert_ne!(*a, *b);
        let single = hkdf_sha256(b"salt", b"ikm", b"split").unwrap();
        assert_eq!(*single, *a);
    }
}
