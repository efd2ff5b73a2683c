//! Three-message authenticated key exchange
//!
//! ```text
//! initiator                                responder
//!   Init { session_id, e_i, nonce }   -->
//!                                     <--  Response { e_r, id_r, sig_r(T_r) }
//!   Finish { id_i, sig_i(T_i) }       -->
//! ```
//!
//! `T_r` hashes the init message with the responder's ephemeral and identity;
//! `T_i` extends `T_r` with the initiator's identity. Both signatures cover both
//! ephemerals, so neither side can be impersonated or replayed into another
//! session. Directional keys come from HKDF over the X25519 secret salted with
//! `T_i`; the ephemerals are dropped once the session exists.

use crate::session::{Role, SecureSession};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use yachaq_core::{Effects, NodeError, Result};
use yachaq_crypto::aead::hkdf_sha256_pair;
use yachaq_crypto::{
    sha256_parts, verify_signature, AgreementPublicKey, AgreementSecret, Digest, KeyRing,
    PublicKey, SignatureBytes, SigningIdentity,
};

const HANDSHAKE_DOMAIN: &[u8] = b"yachaq-p2p-handshake-v1";
const SESSION_KEY_INFO: &[u8] = b"yachaq-p2p-session-keys";
const MAX_SESSION_ID_LEN: usize = 64;

/// Identity that authenticates one side of a handshake
pub trait PeerSigner: Send + Sync {
    /// Public identity key
    fn identity(&self) -> Result<PublicKey>;

    /// Sign a transcript digest
    fn sign(&self, message: &[u8]) -> Result<SignatureBytes>;
}

impl PeerSigner for SigningIdentity {
    fn identity(&self) -> Result<PublicKey> {
        Ok(self.public_key())
    }

    fn sign(&self, message: &[u8]) -> Result<SignatureBytes> {
        Ok(SigningIdentity::sign(self, message))
    }
}

/// The device's pairwise identity toward one counterparty
#[derive(Debug, Clone)]
pub struct PairwiseSigner {
    keyring: Arc<KeyRing>,
    counterparty: String,
}

impl PairwiseSigner {
    /// Sign as the pairwise key for `counterparty`
    pub fn new(keyring: Arc<KeyRing>, counterparty: impl Into<String>) -> Self {
        Self {
            keyring,
            counterparty: counterparty.into(),
        }
    }
}

impl PeerSigner for PairwiseSigner {
    fn identity(&self) -> Result<PublicKey> {
        self.keyring.pairwise(&self.counterparty)
    }

    fn sign(&self, message: &[u8]) -> Result<SignatureBytes> {
        self.keyring.sign_pairwise(&self.counterparty, message)
    }
}

/// First message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    /// Session id chosen by the initiator
    pub session_id: String,
    /// Initiator ephemeral X25519 key
    pub ephemeral: AgreementPublicKey,
    /// Fresh nonce
    pub nonce: [u8; 16],
}

/// Second message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Responder ephemeral X25519 key
    pub ephemeral: AgreementPublicKey,
    /// Responder identity
    pub identity: PublicKey,
    /// Signature over the responder transcript
    pub signature: SignatureBytes,
}

/// Third message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeFinish {
    /// Initiator identity
    pub identity: PublicKey,
    /// Signature over the initiator transcript
    pub signature: SignatureBytes,
}

fn responder_transcript(
    init: &HandshakeInit,
    ephemeral: &AgreementPublicKey,
    identity: &PublicKey,
) -> Digest {
    sha256_parts(&[
        HANDSHAKE_DOMAIN,
        b"responder",
        init.session_id.as_bytes(),
        init.ephemeral.as_bytes(),
        &init.nonce,
        ephemeral.as_bytes(),
        identity.as_bytes(),
    ])
}

fn initiator_transcript(responder: &Digest, identity: &PublicKey) -> Digest {
    sha256_parts(&[
        HANDSHAKE_DOMAIN,
        b"initiator",
        responder.as_bytes(),
        identity.as_bytes(),
    ])
}

fn expect_peer(actual: &PublicKey, expected: &PublicKey) -> Result<()> {
    if actual != expected {
        return Err(NodeError::integrity(format!(
            "peer identity {} is not the expected {}",
            actual.fingerprint(),
            expected.fingerprint()
        )));
    }
    Ok(())
}

/// Initiator state between sending Init and receiving Response
pub struct Initiator {
    init: HandshakeInit,
    ephemeral: AgreementSecret,
}

impl Initiator {
    /// Fresh ephemeral key, session id and nonce
    pub fn start(effects: &Effects) -> (Self, HandshakeInit) {
        let ephemeral = AgreementSecret::generate(effects);
        let session_bytes: [u8; 16] = effects.random_bytes();
        let init = HandshakeInit {
            session_id: session_bytes.iter().map(|b| format!("{b:02x}")).collect(),
            ephemeral: ephemeral.public_key(),
            nonce: effects.random_bytes(),
        };
        (
            Self {
                init: init.clone(),
                ephemeral,
            },
            init,
        )
    }

    /// Check the responder against `expected_peer`, then sign and derive keys
    pub fn finish(
        self,
        response: &HandshakeResponse,
        signer: &dyn PeerSigner,
        expected_peer: &PublicKey,
        expires_at_ms: u64,
    ) -> Result<(SecureSession, HandshakeFinish)> {
        expect_peer(&response.identity, expected_peer)?;
        let transcript = responder_transcript(&self.init, &response.ephemeral, &response.identity);
        verify_signature(&response.identity, transcript.as_bytes(), &response.signature)?;

        let identity = signer.identity()?;
        let final_transcript = initiator_transcript(&transcript, &identity);
        let signature = signer.sign(final_transcript.as_bytes())?;
        let shared = self.ephemeral.diffie_hellman(&response.ephemeral)?;
        let keys = hkdf_sha256_pair(final_transcript.as_bytes(), &shared[..], SESSION_KEY_INFO)?;
        debug!(session_id = %self.init.session_id, "handshake complete (initiator)");
        Ok((
            SecureSession::new(
                self.init.session_id,
                Role::Initiator,
                response.identity,
                keys,
                expires_at_ms,
            ),
            HandshakeFinish {
                identity,
                signature,
            },
        ))
    }
}

/// Responder state between sending Response and receiving Finish
pub struct Responder {
    init: HandshakeInit,
    ephemeral: AgreementSecret,
    transcript: Digest,
}

impl Responder {
    /// Answer an Init message
    pub fn respond(
        init: HandshakeInit,
        signer: &dyn PeerSigner,
        effects: &Effects,
    ) -> Result<(Self, HandshakeResponse)> {
        if init.session_id.is_empty() || init.session_id.len() > MAX_SESSION_ID_LEN {
            return Err(NodeError::validation("handshake session id has a bad length"));
        }
        let ephemeral = AgreementSecret::generate(effects);
        let identity = signer.identity()?;
        let transcript = responder_transcript(&init, &ephemeral.public_key(), &identity);
        let signature = signer.sign(transcript.as_bytes())?;
        let response = HandshakeResponse {
            ephemeral: ephemeral.public_key(),
            identity,
            signature,
        };
        Ok((
            Self {
                init,
                ephemeral,
                transcript,
            },
            response,
        ))
    }

    /// Check the initiator against `expected_peer` and derive keys
    pub fn complete(
        self,
        finish: &HandshakeFinish,
        expected_peer: &PublicKey,
        expires_at_ms: u64,
    ) -> Result<SecureSession> {
        expect_peer(&finish.identity, expected_peer)?;
        let final_transcript = initiator_transcript(&self.transcript, &finish.identity);
        verify_signature(&finish.identity, final_transcript.as_bytes(), &finish.signature)?;
        let shared = self.ephemeral.diffie_hellman(&self.init.ephemeral)?;
        let keys = hkdf_sha256_pair(final_transcript.as_bytes(), &shared[..], SESSION_KEY_INFO)?;
        debug!(session_id = %self.init.session_id, "handshake complete (responder)");
        Ok(SecureSession::new(
            self.init.session_id,
            Role::Responder,
            finish.identity,
            keys,
            expires_at_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Pair {
        effects: Effects,
        device: PairwiseSigner,
        requester: SigningIdentity,
    }

    fn pair() -> Pair {
        let (effects, _) = Effects::deterministic(12, 0);
        let keyring = Arc::new(KeyRing::generate(&effects));
        Pair {
            device: PairwiseSigner::new(keyring, "acme-research"),
            requester: SigningIdentity::generate(&effects),
            effects,
        }
    }

    fn establish(p: &Pair) -> (SecureSession, SecureSession) {
        let (initiator, init) = Initiator::start(&p.effects);
        let (responder, response) = Responder::respond(init, &p.requester, &p.effects).unwrap();
        let (device_session, finish) = initiator
            .finish(&response, &p.device, &p.requester.public_key(), 10_000)
            .unwrap();
        let requester_session = responder
            .complete(&finish, &p.device.identity().unwrap(), 10_000)
            .unwrap();
        (device_session, requester_session)
    }

    #[test]
    fn test_both_directions() {
        let p = pair();
        let (mut device, mut requester) = establish(&p);
        assert_eq!(device.session_id(), requester.session_id());
        assert_eq!(device.peer(), &p.requester.public_key());

        let frame = device.seal(b"manifest").unwrap();
        assert_eq!(requester.open(&frame).unwrap(), b"manifest");
        let frame = requester.seal(b"ack").unwrap();
        assert_eq!(device.open(&frame).unwrap(), b"ack");
    }

    #[test]
    fn test_replayed_frame_rejected() {
        let p = pair();
        let (mut device, mut requester) = establish(&p);
        let frame = device.seal(b"chunk 0").unwrap();
        requester.open(&frame).unwrap();
        assert_matches!(requester.open(&frame), Err(NodeError::ReplayDetected { .. }));
    }

    #[test]
    fn test_impostor_responder_rejected() {
        let p = pair();
        let impostor = SigningIdentity::generate(&p.effects);
        let (initiator, init) = Initiator::start(&p.effects);
        let (_, response) = Responder::respond(init, &impostor, &p.effects).unwrap();
        assert_matches!(
            initiator.finish(&response, &p.device, &p.requester.public_key(), 10_000),
            Err(NodeError::IntegrityFailure { .. })
        );
    }

    #[test]
    fn test_response_from_other_session_rejected() {
        let p = pair();
        let (initiator, _) = Initiator::start(&p.effects);
        let (_, other_init) = Initiator::start(&p.effects);
        let (_, response) = Responder::respond(other_init, &p.requester, &p.effects).unwrap();
        assert_matches!(
            initiator.finish(&response, &p.device, &p.requester.public_key(), 10_000),
            Err(NodeError::IntegrityFailure { .. })
        );
    }

    #[test]
    fn test_sessions_do_not_share_keys() {
        let p = pair();
        let (mut first, _) = establish(&p);
        let (_, mut second) = establish(&p);
        let frame = first.seal(b"hello").unwrap();
        assert!(second.open(&frame).is_err());
    }
}
