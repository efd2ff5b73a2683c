//! Established sessions: directional keys and counter-bound frames

use crate::wire;
use serde::{Deserialize, Serialize};
use yachaq_core::{NodeError, Result};
use yachaq_crypto::aead::{self, counter_nonce, KEY_LEN};
use yachaq_crypto::PublicKey;
use zeroize::Zeroizing;

/// Which side of the handshake this session was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the first handshake message
    Initiator,
    /// Answered it
    Responder,
}

/// An encrypted frame on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFrame {
    /// Sender's message counter, also the AEAD nonce
    pub counter: u64,
    /// Ciphertext with tag
    pub ciphertext: Vec<u8>,
}

/// A mutually authenticated session with forward-secret keys
pub struct SecureSession {
    session_id: String,
    role: Role,
    peer: PublicKey,
    send_key: Zeroizing<[u8; KEY_LEN]>,
    recv_key: Zeroizing<[u8; KEY_LEN]>,
    send_counter: u64,
    recv_counter: u64,
    expires_at_ms: u64,
}

impl SecureSession {
    pub(crate) fn new(
        session_id: String,
        role: Role,
        peer: PublicKey,
        keys: (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>),
        expires_at_ms: u64,
    ) -> Self {
        let (initiator_to_responder, responder_to_initiator) = keys;
        let (send_key, recv_key) = match role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };
        Self {
            session_id,
            role,
            peer,
            send_key,
            recv_key,
            send_counter: 0,
            recv_counter: 0,
            expires_at_ms,
        }
    }

    /// Session id chosen by the initiator
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Our role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Authenticated identity of the peer
    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    /// Expiry time
    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    /// Whether the session is past its lifetime
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Encrypt `plaintext` into the next outbound frame
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.send_counter;
        let ciphertext = aead::seal(
            &self.send_key,
            &counter_nonce(counter),
            self.session_id.as_bytes(),
            plaintext,
        )?;
        self.send_counter = counter
            .checked_add(1)
            .ok_or_else(|| NodeError::resource_exceeded("session", "frame counter exhausted"))?;
        wire::encode(&SessionFrame {
            counter,
            ciphertext,
        })
    }

    /// Decrypt the next inbound frame; frames must arrive in counter order
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let frame: SessionFrame = wire::decode(frame)?;
        if frame.counter != self.recv_counter {
            return Err(NodeError::replay(format!(
                "frame {} out of sequence, expected {}",
                frame.counter, self.recv_counter
            )));
        }
        let plaintext = aead::open(
            &self.recv_key,
            &counter_nonce(frame.counter),
            self.session_id.as_bytes(),
            &frame.ciphertext,
        )?;
        self.recv_counter += 1;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("peer", &self.peer.fingerprint())
            .field("sent", &self.send_counter)
            .field("received", &self.recv_counter)
            .finish_non_exhaustive()
    }
}
