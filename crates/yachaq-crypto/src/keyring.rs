//! Device identity and key management
//!
//! The [`KeyRing`] is the sole owner of the node's secret material:
//!
//! - a root Ed25519 identity (its fingerprint is the [`NodeId`]),
//! - per-counterparty pairwise Ed25519 identities derived with HKDF from the root
//!   secret, so two requesters cannot link the same node; each pairwise identity
//!   carries an epoch and rotates by bumping it,
//! - an X25519 agreement key for receiving sealed capsule keys,
//! - ephemeral session keys derived from X25519 agreement with a peer.
//!
//! At rest the root and agreement secrets are sealed with [`SealedData`] under a
//! device secret supplied by the platform key store.

use crate::agreement::AgreementSecret;
use crate::aead;
use crate::sealing::SealedData;
use crate::signature::{public_of, sign_with};
use crate::types::{AgreementPublicKey, PublicKey, SignatureBytes};
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use yachaq_core::{Effects, NodeError, NodeId, Result};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEYRING_CONTEXT: &str = "yachaq-keyring-v1";
const KEYRING_STORAGE_KEY: &str = "keyring";
const PAIRWISE_INFO: &[u8] = b"yachaq-pairwise-v1";
const SESSION_INFO: &[u8] = b"yachaq-session-v1";

/// Platform secure storage for small secrets (Keychain, Keystore, Secret Service)
pub trait SecureKeyStore: Send + Sync {
    /// Store bytes under `key`
    fn store_secure_data(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Load bytes stored under `key`
    fn load_secure_data(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete bytes stored under `key`
    fn delete_secure_data(&self, key: &str) -> Result<()>;
}

/// In-memory key store for tests and ephemeral nodes
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn store_secure_data(&self, key: &str, data: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn load_secure_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete_secure_data(&self, key: &str) -> Result<()> {
        if let Some(mut data) = self.entries.lock().remove(key) {
            data.zeroize();
        }
        Ok(())
    }
}

/// Secret material persisted through the key store
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    root_secret: [u8; 32],
    agreement_secret: [u8; 32],
    #[zeroize(skip)]
    pairwise_epochs: BTreeMap<String, u32>,
}

/// Device identity and key manager
pub struct KeyRing {
    root: SigningKey,
    root_secret: Zeroizing<[u8; 32]>,
    agreement: AgreementSecret,
    pairwise_epochs: RwLock<BTreeMap<String, u32>>,
    sessions: Mutex<HashMap<String, Zeroizing<[u8; 32]>>>,
}

impl KeyRing {
    /// Fresh identity from the injected RNG
    pub fn generate(effects: &Effects) -> Self {
        let root_secret = Zeroizing::new(effects.random_bytes::<32>());
        let agreement = AgreementSecret::generate(effects);
        Self::from_parts(root_secret, agreement, BTreeMap::new())
    }

    fn from_parts(
        root_secret: Zeroizing<[u8; 32]>,
        agreement: AgreementSecret,
        pairwise_epochs: BTreeMap<String, u32>,
    ) -> Self {
        Self {
            root: SigningKey::from_bytes(&root_secret),
            root_secret,
            agreement,
            pairwise_epochs: RwLock::new(pairwise_epochs),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Load the sealed key material from `store`, or generate and persist it
    pub fn load_or_create(
        store: &dyn SecureKeyStore,
        device_secret: &[u8; 32],
        effects: &Effects,
    ) -> Result<Self> {
        if let Some(bytes) = store.load_secure_data(KEYRING_STORAGE_KEY)? {
            let sealed: SealedData = serde_json::from_slice(&bytes)?;
            let material: KeyMaterial = sealed.unseal_value(device_secret)?;
            let keyring = Self::from_parts(
                Zeroizing::new(material.root_secret),
                AgreementSecret::from_bytes(material.agreement_secret),
                material.pairwise_epochs.clone(),
            );
            tracing::info!(node_id = %keyring.node_id(), "Loaded key ring");
            return Ok(keyring);
        }

        let keyring = Self::generate(effects);
        keyring.persist(store, device_secret, effects)?;
        tracing::info!(node_id = %keyring.node_id(), "Created key ring");
        Ok(keyring)
    }

    /// Seal the current key material into `store`
    pub fn persist(
        &self,
        store: &dyn SecureKeyStore,
        device_secret: &[u8; 32],
        effects: &Effects,
    ) -> Result<()> {
        let material = KeyMaterial {
            root_secret: *self.root_secret,
            agreement_secret: *self.agreement.as_secret_bytes(),
            pairwise_epochs: self.pairwise_epochs.read().clone(),
        };
        let node_id = self.node_id();
        let sealed = SealedData::seal_value(
            &material,
            device_secret,
            KEYRING_CONTEXT,
            Some(node_id.0.as_bytes()),
            effects,
        )?;
        let bytes = serde_json::to_vec(&sealed)?;
        store.store_secure_data(KEYRING_STORAGE_KEY, &bytes)
    }

    /// Fingerprint of the root public key
    pub fn node_id(&self) -> NodeId {
        NodeId(self.root_public().fingerprint())
    }

    /// Root Ed25519 public key
    pub fn root_public(&self) -> PublicKey {
        public_of(&self.root)
    }

    /// Sign with the root identity
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        sign_with(&self.root, message)
    }

    /// Current pairwise epoch for `counterparty` (0 until first rotation)
    pub fn pairwise_epoch(&self, counterparty: &str) -> u32 {
        self.pairwise_epochs
            .read()
            .get(counterparty)
            .copied()
            .unwrap_or_default()
    }

    fn pairwise_key(&self, counterparty: &str) -> Result<SigningKey> {
        let epoch = self.pairwise_epoch(counterparty);
        let mut info = PAIRWISE_INFO.to_vec();
        info.push(b':');
        info.extend_from_slice(counterparty.as_bytes());
        info.push(b':');
        info.extend_from_slice(&epoch.to_be_bytes());
        let seed = aead::hkdf_sha256(b"yachaq-pairwise-salt", &self.root_secret[..], &info)?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Pairwise public key presented to `counterparty`
    pub fn pairwise(&self, counterparty: &str) -> Result<PublicKey> {
        Ok(public_of(&self.pairwise_key(counterparty)?))
    }

    /// Sign with the pairwise identity for `counterparty`
    pub fn sign_pairwise(&self, counterparty: &str, message: &[u8]) -> Result<SignatureBytes> {
        Ok(sign_with(&self.pairwise_key(counterparty)?, message))
    }

    /// Move `counterparty` to a new pairwise epoch and return the new public key
    pub fn rotate_pairwise(&self, counterparty: &str) -> Result<PublicKey> {
        let epoch = {
            let mut epochs = self.pairwise_epochs.write();
            let epoch = epochs.entry(counterparty.to_string()).or_default();
            *epoch = epoch.saturating_add(1);
            *epoch
        };
        tracing::info!(epoch, "Rotated pairwise identity");
        self.pairwise(counterparty)
    }

    /// X25519 public key that capsule keys are sealed to
    pub fn agreement_public(&self) -> AgreementPublicKey {
        self.agreement.public_key()
    }

    /// X25519 secret for opening sealed boxes addressed to this node
    pub fn agreement_secret(&self) -> &AgreementSecret {
        &self.agreement
    }

    /// Derive and remember a session key shared with `peer_public`
    pub fn derive_session_key(
        &self,
        session_id: &str,
        peer_public: &AgreementPublicKey,
    ) -> Result<Zeroizing<[u8; 32]>> {
        if session_id.is_empty() {
            return Err(NodeError::validation("session id must not be empty"));
        }
        let shared = self.agreement.diffie_hellman(peer_public)?;
        let key = aead::hkdf_sha256(session_id.as_bytes(), &shared[..], SESSION_INFO)?;
        self.sessions
            .lock()
            .insert(session_id.to_string(), key.clone());
        Ok(key)
    }

    /// Forget a session key
    pub fn invalidate_session(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Number of live session keys
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::verify_signature;

    #[test]
    fn test_pairwise_keys_are_unlinkable() {
        let (effects, _) = Effects::deterministic(60, 0);
        let keyring = KeyRing::generate(&effects);
        let a = keyring.pairwise("requester-a").unwrap();
        let b = keyring.pairwise("requester-b").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, keyring.root_public());
        assert_eq!(a, keyring.pairwise("requester-a").unwrap());
    }

    #[test]
    fn test_sign_pairwise_verifies() {
        let (effects, _) = Effects::deterministic(61, 0);
        let keyring = KeyRing::generate(&effects);
        let sig = keyring.sign_pairwise("requester-a", b"contract").unwrap();
        let public = keyring.pairwise("requester-a").unwrap();
        verify_signature(&public, b"contract", &sig).unwrap();
        assert!(verify_signature(&keyring.root_public(), b"contract", &sig).is_err());
    }

    #[test]
    fn test_rotate_pairwise_changes_key() {
        let (effects, _) = Effects::deterministic(62, 0);
        let keyring = KeyRing::generate(&effects);
        let before = keyring.pairwise("requester-a").unwrap();
        let after = keyring.rotate_pairwise("requester-a").unwrap();
        assert_ne!(before, after);
        assert_eq!(keyring.pairwise_epoch("requester-a"), 1);
        assert_eq!(keyring.pairwise_epoch("requester-b"), 0);
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let (effects, _) = Effects::deterministic(63, 0);
        let store = MemoryKeyStore::new();
        let device_secret = [8u8; 32];

        let first = KeyRing::load_or_create(&store, &device_secret, &effects).unwrap();
        first.rotate_pairwise("requester-a").unwrap();
        first.persist(&store, &device_secret, &effects).unwrap();

        let second = KeyRing::load_or_create(&store, &device_secret, &effects).unwrap();
        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.agreement_public(), second.agreement_public());
        assert_eq!(
            first.pairwise("requester-a").unwrap(),
            second.pairwise("requester-a").unwrap()
        );
    }

    #[test]
    fn test_wrong_device_secret_cannot_load() {
        let (effects, _) = Effects::deterministic(64, 0);
        let store = MemoryKeyStore::new();
        KeyRing::load_or_create(&store, &[1u8; 32], &effects).unwrap();
        assert!(KeyRing::load_or_create(&store, &[2u8; 32], &effects).is_err());
    }

    #[test]
    fn test_session_keys_agree_and_invalidate() {
        let (effects, _) = Effects::deterministic(65, 0);
        let alice = KeyRing::generate(&effects);
        let bob = KeyRing::generate(&effects);

        let ka = alice
            .derive_session_key("session-1", &bob.agreement_public())
            .unwrap();
        let kb = bob
            .derive_session_key("session-1", &alice.agreement_public())
            .unwrap();
        assert_eq!(*ka, *kb);
        assert_eq!(alice.session_count(), 1);
        assert!(alice.invalidate_session("session-1"));
        assert_eq!(alice.session_count(), 0);
    }
}
