//! Network gate: default-deny egress control
//!
//! Every outbound byte leaves through [`NetworkGate::authorize`]. Destinations are
//! registered with a purpose and a [`PayloadClass`]; there is no class for raw
//! data. Metadata is scanned for personal identifiers and ciphertext frames must
//! look like ciphertext. While plan execution holds the [`EgressLock`], nothing
//! leaves at all.

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use yachaq_core::{AuditEventType, AuditRecord, AuditSink, Effects, EgressLock, NodeError, Result};

/// Frames at least this long must pass the entropy test
pub const ENTROPY_CHECK_MIN_BYTES: usize = 1024;
/// Minimum Shannon entropy of a ciphertext frame, in bits per byte
pub const MIN_CIPHERTEXT_ENTROPY: f64 = 7.0;

const MAX_BLOCKED_LOG: usize = 1_000;

const IDENTIFIER_PATTERNS: [(&str, &str); 4] = [
    ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("phone", r"\b\d{3}[-. ]?\d{3}[-. ]?\d{4}\b"),
    ("ip_address", r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b"),
];

/// What a destination may receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadClass {
    /// Small structured metadata without personal identifiers
    MetadataOnly,
    /// Encrypted capsule frames
    CiphertextCapsule,
}

/// A registered destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Normalised domain
    pub domain: String,
    /// Why the device talks to it
    pub purpose: String,
    /// Allowed payload class
    pub payload_class: PayloadClass,
    /// Registration time
    pub registered_at_ms: u64,
}

/// An outbound payload presented to the gate
#[derive(Debug, Clone, Copy)]
pub enum Outbound<'a> {
    /// Metadata text
    Metadata(&'a str),
    /// Ciphertext frame
    Ciphertext(&'a [u8]),
}

impl Outbound<'_> {
    /// Class the payload claims
    pub fn class(&self) -> PayloadClass {
        match self {
            Self::Metadata(_) => PayloadClass::MetadataOnly,
            Self::Ciphertext(_) => PayloadClass::CiphertextCapsule,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Metadata(text) => text.len(),
            Self::Ciphertext(bytes) => bytes.len(),
        }
    }
}

/// Why the gate refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// A plan is executing
    ExecutionLockdown,
    /// Destination is not a valid domain
    InvalidDestination,
    /// Destination never registered or revoked
    UnknownDestination,
    /// Payload class differs from the registration
    ClassMismatch,
    /// Metadata contained a personal identifier
    IdentifierDetected,
    /// Claimed ciphertext does not look encrypted
    LowEntropy,
}

impl DenialReason {
    /// Stable name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionLockdown => "execution_lockdown",
            Self::InvalidDestination => "invalid_destination",
            Self::UnknownDestination => "unknown_destination",
            Self::ClassMismatch => "class_mismatch",
            Self::IdentifierDetected => "identifier_detected",
            Self::LowEntropy => "low_entropy",
        }
    }
}

/// One refused egress attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedAttempt {
    /// Destination as presented
    pub destination: String,
    /// Reason
    pub reason: DenialReason,
    /// Payload size in bytes
    pub size: usize,
    /// Time of the attempt
    pub at_ms: u64,
}

/// Gate counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    /// Authorized payloads
    pub allowed: u64,
    /// Refused payloads
    pub denied: u64,
    /// Bytes authorized
    pub bytes_allowed: u64,
    /// Refusals per reason
    pub denied_by_reason: BTreeMap<DenialReason, u64>,
    /// Live registrations
    pub registrations: usize,
}

/// Default-deny egress gate
pub struct NetworkGate {
    registrations: RwLock<BTreeMap<String, Registration>>,
    blocked: Mutex<VecDeque<BlockedAttempt>>,
    stats: Mutex<GateStats>,
    identifiers: Vec<(&'static str, Regex)>,
    egress: EgressLock,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl NetworkGate {
    /// Gate with no registrations, honouring `egress` lockdown
    pub fn new(egress: EgressLock, audit: Arc<dyn AuditSink>, effects: Effects) -> Result<Self> {
        let identifiers = IDENTIFIER_PATTERNS
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|re| (*name, re))
                    .map_err(|e| NodeError::internal(format!("identifier pattern {name}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            registrations: RwLock::new(BTreeMap::new()),
            blocked: Mutex::new(VecDeque::new()),
            stats: Mutex::new(GateStats::default()),
            identifiers,
            egress,
            audit,
            effects,
        })
    }

    /// Allow `domain` to receive `payload_class` for `purpose`
    pub fn register(
        &self,
        domain: &str,
        purpose: &str,
        payload_class: PayloadClass,
    ) -> Result<Registration> {
        let domain = normalize_domain(domain)?;
        if purpose.trim().is_empty() {
            return Err(NodeError::validation("registration purpose must not be blank"));
        }
        let registration = Registration {
            domain: domain.clone(),
            purpose: purpose.trim().to_string(),
            payload_class,
            registered_at_ms: self.effects.now_ms(),
        };
        self.registrations
            .write()
            .insert(domain.clone(), registration.clone());
        info!(domain = %domain, class = ?payload_class, "egress destination registered");
        Ok(registration)
    }

    /// Remove a registration; returns whether one existed
    pub fn revoke(&self, domain: &str) -> bool {
        match normalize_domain(domain) {
            Ok(domain) => self.registrations.write().remove(&domain).is_some(),
            Err(_) => false,
        }
    }

    /// Registration for `domain`, if any
    pub fn registration(&self, domain: &str) -> Option<Registration> {
        let domain = normalize_domain(domain).ok()?;
        self.registrations.read().get(&domain).cloned()
    }

    /// Decide whether `outbound` may go to `destination`
    pub fn authorize(&self, destination: &str, outbound: Outbound<'_>) -> Result<()> {
        match self.check(destination, outbound) {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.allowed += 1;
                stats.bytes_allowed += outbound.len() as u64;
                debug!(destination, size = outbound.len(), "egress authorized");
                Ok(())
            }
            Err((reason, message)) => self.deny(destination, outbound.len(), reason, message),
        }
    }

    fn check(
        &self,
        destination: &str,
        outbound: Outbound<'_>,
    ) -> std::result::Result<(), (DenialReason, String)> {
        if self.egress.is_locked() {
            return Err((
                DenialReason::ExecutionLockdown,
                "egress is locked while a plan executes".into(),
            ));
        }
        let domain = normalize_domain(destination)
            .map_err(|_| (DenialReason::InvalidDestination, "invalid destination".into()))?;
        let registration = self.registrations.read().get(&domain).cloned().ok_or_else(|| {
            (
                DenialReason::UnknownDestination,
                format!("{domain} is not registered"),
            )
        })?;
        if registration.payload_class != outbound.class() {
            return Err((
                DenialReason::ClassMismatch,
                format!(
                    "{domain} accepts {:?}, not {:?}",
                    registration.payload_class,
                    outbound.class()
                ),
            ));
        }
        match outbound {
            Outbound::Metadata(text) => {
                if let Some((name, _)) = self.identifiers.iter().find(|(_, re)| re.is_match(text)) {
                    return Err((
                        DenialReason::IdentifierDetected,
                        format!("metadata contains a {name}"),
                    ));
                }
            }
            Outbound::Ciphertext(bytes) => {
                if bytes.len() >= ENTROPY_CHECK_MIN_BYTES {
                    let entropy = shannon_entropy(bytes);
                    if entropy < MIN_CIPHERTEXT_ENTROPY {
                        return Err((
                            DenialReason::LowEntropy,
                            format!("frame entropy {entropy:.2} bits/byte is too low"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn deny(
        &self,
        destination: &str,
        size: usize,
        reason: DenialReason,
        message: String,
    ) -> Result<()> {
        let at_ms = self.effects.now_ms();
        {
            let mut stats = self.stats.lock();
            stats.denied += 1;
            *stats.denied_by_reason.entry(reason).or_default() += 1;
        }
        {
            let mut blocked = self.blocked.lock();
            if blocked.len() == MAX_BLOCKED_LOG {
                blocked.pop_front();
            }
            blocked.push_back(BlockedAttempt {
                destination: destination.to_string(),
                reason,
                size,
                at_ms,
            });
        }
        warn!(destination, reason = reason.as_str(), "egress denied");
        self.audit.append(
            AuditRecord::new(AuditEventType::NetworkGateDenied)
                .with("destination", destination)
                .with("reason", reason.as_str()),
        )?;
        Err(NodeError::gate_denied(message))
    }

    /// Refused attempts, oldest first
    pub fn blocked_attempts(&self) -> Vec<BlockedAttempt> {
        self.blocked.lock().iter().cloned().collect()
    }

    /// Counters
    pub fn stats(&self) -> GateStats {
        let mut stats = self.stats.lock().clone();
        stats.registrations = self.registrations.read().len();
        stats
    }
}

impl std::fmt::Debug for NetworkGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkGate")
            .field("registrations", &self.registrations.read().len())
            .field("locked", &self.egress.is_locked())
            .finish_non_exhaustive()
    }
}

/// Lowercase host name without scheme, port, path or trailing dot
pub fn normalize_domain(input: &str) -> Result<String> {
    let mut host = input.trim().to_ascii_lowercase();
    if let Some(index) = host.find("://") {
        host.drain(..index + 3);
    }
    if let Some(index) = host.find(|c: char| matches!(c, '/' | '?' | '#')) {
        host.truncate(index);
    }
    if let Some(index) = host.rfind(':') {
        if host[index + 1..].chars().all(|c| c.is_ascii_digit()) {
            host.truncate(index);
        }
    }
    let host = host.trim_end_matches('.').to_string();
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    };
    if host.is_empty() || host.len() > 253 || !host.split('.').all(valid_label) {
        return Err(NodeError::validation(format!("invalid domain {input:?}")));
    }
    Ok(host)
}

/// Shannon entropy in bits per byte
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for b in bytes {
        counts[*b as usize] += 1;
    }
    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use yachaq_audit::AuditLog;

    fn gate() -> (NetworkGate, EgressLock, Arc<AuditLog>, Effects) {
        let (effects, _) = Effects::deterministic(3, 1_000);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        let egress = EgressLock::new();
        let gate = NetworkGate::new(egress.clone(), audit.clone(), effects.clone()).unwrap();
        (gate, egress, audit, effects)
    }

    fn noise(effects: &Effects) -> Vec<u8> {
        (0..8).flat_map(|_| effects.random_bytes::<512>()).collect()
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(
            normalize_domain("HTTPS://Relay.Example.org:8443/path?q=1").unwrap(),
            "relay.example.org"
        );
        assert_eq!(normalize_domain("example.org.").unwrap(), "example.org");
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("bad_domain.org").is_err());
        assert!(normalize_domain("-lead.org").is_err());
    }

    #[test]
    fn test_default_deny() {
        let (gate, _, audit, effects) = gate();
        let frame = noise(&effects);
        assert_matches!(
            gate.authorize("requester.example", Outbound::Ciphertext(&frame)),
            Err(NodeError::NetworkGateDenied { .. })
        );
        let blocked = gate.blocked_attempts();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].reason, DenialReason::UnknownDestination);
        let export = audit.export().unwrap();
        assert_eq!(export.of_type(AuditEventType::NetworkGateDenied).len(), 1);
    }

    #[test]
    fn test_registered_ciphertext_passes() {
        let (gate, _, _, effects) = gate();
        gate.register("Requester.Example", "capsule delivery", PayloadClass::CiphertextCapsule)
            .unwrap();
        let frame = noise(&effects);
        gate.authorize("https://requester.example/p2p", Outbound::Ciphertext(&frame))
            .unwrap();
        // short frames skip the entropy test
        gate.authorize("requester.example", Outbound::Ciphertext(b"hello"))
            .unwrap();
        let stats = gate.stats();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 0);
        assert_eq!(stats.registrations, 1);
    }

    #[test]
    fn test_plaintext_posing_as_ciphertext() {
        let (gate, _, _, _) = gate();
        gate.register("requester.example", "capsule delivery", PayloadClass::CiphertextCapsule)
            .unwrap();
        let plaintext = "steps=8421;heart_rate=71;".repeat(100);
        assert_matches!(
            gate.authorize("requester.example", Outbound::Ciphertext(plaintext.as_bytes())),
            Err(NodeError::NetworkGateDenied { .. })
        );
        assert_eq!(gate.stats().denied_by_reason[&DenialReason::LowEntropy], 1);
    }

    #[test]
    fn test_class_mismatch() {
        let (gate, _, _, effects) = gate();
        gate.register("coordinator.example", "offers", PayloadClass::MetadataOnly)
            .unwrap();
        let frame = noise(&effects);
        assert!(gate
            .authorize("coordinator.example", Outbound::Ciphertext(&frame))
            .is_err());
        assert_eq!(gate.blocked_attempts()[0].reason, DenialReason::ClassMismatch);
    }

    #[test]
    fn test_identifiers_in_metadata() {
        let (gate, _, _, _) = gate();
        gate.register("coordinator.example", "offers", PayloadClass::MetadataOnly)
            .unwrap();
        gate.authorize(
            "coordinator.example",
            Outbound::Metadata(r#"{"offer":"accepted","labels":3}"#),
        )
        .unwrap();
        for leak in [
            "contact ana@example.org",
            "call 555-123-4567",
            "ssn 123-45-6789",
            "from 192.168.1.20",
        ] {
            assert!(
                gate.authorize("coordinator.example", Outbound::Metadata(leak)).is_err(),
                "{leak}"
            );
        }
        assert_eq!(gate.stats().denied_by_reason[&DenialReason::IdentifierDetected], 4);
    }

    #[test]
    fn test_lockdown_and_revoke() {
        let (gate, egress, _, effects) = gate();
        gate.register("requester.example", "capsule delivery", PayloadClass::CiphertextCapsule)
            .unwrap();
        let frame = noise(&effects);
        {
            let _guard = egress.lock();
            assert!(gate
                .authorize("requester.example", Outbound::Ciphertext(&frame))
                .is_err());
        }
        gate.authorize("requester.example", Outbound::Ciphertext(&frame))
            .unwrap();

        assert!(gate.revoke("REQUESTER.example"));
        assert!(gate
            .authorize("requester.example", Outbound::Ciphertext(&frame))
            .is_err());
        let reasons: Vec<_> = gate.blocked_attempts().iter().map(|a| a.reason).collect();
        assert_eq!(
            reasons,
            vec![DenialReason::ExecutionLockdown, DenialReason::UnknownDestination]
        );
    }

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 64]), 0.0);
        let all: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
    }
}
