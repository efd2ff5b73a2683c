//! Consent contracts
//!
//! A contract moves through three types: [`ContractDraft`] (narrowing only),
//! [`SingleSignedContract`] (signed by the device with its pairwise key for the
//! requester) and [`ActiveContract`] (countersigned, immutable). Both signatures
//! cover the same canonical terms hash.

use crate::request::{Compensation, DataRequest, OutputMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use yachaq_core::config::CapsuleConfig;
use yachaq_core::time::MS_PER_SEC;
use yachaq_core::{
    to_canonical_bytes, ContractId, Effects, NodeError, RequestId, Result, TimeWindow,
};
use yachaq_crypto::{
    sha256, verify_signature, AgreementPublicKey, Digest, KeyRing, PublicKey, SignatureBytes,
};

const CONTRACT_DOMAIN: &[u8] = b"yachaq-contract-v1";

/// Largest optional-label bonus, in percent of the base price
pub const MAX_OPTIONAL_BONUS_PERCENT: u64 = 20;

/// Duties the requester accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Obligation {
    /// No attempt to re-identify the data subject
    NoReidentification,
    /// No transfer to third parties
    NoOnwardTransfer,
    /// Delete results when the contract expires
    DeleteOnExpiry,
    /// Only aggregate results may be derived
    AggregateResultsOnly,
}

/// Scope granted by a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractScope {
    /// Labels covered
    pub labels: BTreeSet<String>,
    /// Record types a plan may select
    pub record_types: BTreeSet<String>,
    /// Row fields a plan may reference
    pub fields: BTreeSet<String>,
    /// Data time window
    pub time_window: TimeWindow,
    /// Granted output mode
    pub output_mode: OutputMode,
}

impl ContractScope {
    /// Whether `field` is covered, honouring `prefix*` wildcards
    pub fn allows_field(&self, field: &str) -> bool {
        self.fields.iter().any(|allowed| match allowed.strip_suffix('*') {
            Some(prefix) => field.starts_with(prefix),
            None => allowed == field,
        })
    }

    /// Whether `record_type` is covered
    pub fn allows_record_type(&self, record_type: &str) -> bool {
        self.record_types.contains(record_type)
    }
}

/// Everything both parties sign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerms {
    /// Contract id
    pub contract_id: ContractId,
    /// Originating request
    pub request_id: RequestId,
    /// Requester
    pub requester_id: String,
    /// Granted scope
    pub scope: ContractScope,
    /// Cohort floor for aggregates
    pub k_min: u64,
    /// Start of validity
    pub starts_at_ms: u64,
    /// End of validity
    pub expires_at_ms: u64,
    /// Capsule time-to-live in seconds
    pub capsule_ttl_secs: u64,
    /// Agreed price
    pub price: Compensation,
    /// Requester duties
    pub obligations: BTreeSet<Obligation>,
    /// Contract nonce, hex
    pub nonce: String,
    /// Device pairwise key for this requester
    pub ds_key: PublicKey,
    /// Requester signing key
    pub requester_key: PublicKey,
    /// Requester X25519 key capsules are sealed to
    pub requester_agreement_key: AgreementPublicKey,
}

impl ContractTerms {
    /// SHA-256 of the canonical terms
    pub fn contract_hash(&self) -> Result<Digest> {
        Ok(sha256(&to_canonical_bytes(self)?))
    }

    /// Message both parties sign
    pub fn signing_message(&self) -> Result<Vec<u8>> {
        let hash = self.contract_hash()?;
        let mut message = Vec::with_capacity(CONTRACT_DOMAIN.len() + 32);
        message.extend_from_slice(CONTRACT_DOMAIN);
        message.extend_from_slice(hash.as_bytes());
        Ok(message)
    }
}

/// The user's choices when accepting an offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeChoices {
    /// Labels to share; must include every required label
    pub labels: BTreeSet<String>,
    /// Output mode; only narrower than requested
    pub output_mode: OutputMode,
    /// Contract duration; configuration default when `None`
    pub duration_secs: Option<u64>,
}

impl ScopeChoices {
    /// Accept the request as asked, with every optional label
    pub fn accept_all(request: &DataRequest) -> Self {
        let scope = &request.body.scope;
        Self {
            labels: scope
                .required_labels
                .union(&scope.optional_labels)
                .cloned()
                .collect(),
            output_mode: scope.output_mode,
            duration_secs: None,
        }
    }
}

/// Contract under negotiation; every change narrows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractDraft {
    contract_id: ContractId,
    request_id: RequestId,
    requester_id: String,
    required_labels: BTreeSet<String>,
    optional_labels: BTreeSet<String>,
    scope: ContractScope,
    k_min: u64,
    starts_at_ms: u64,
    expires_at_ms: u64,
    capsule_ttl_secs: u64,
    base_price: Compensation,
    nonce: String,
    requester_key: PublicKey,
    requester_agreement_key: AgreementPublicKey,
}

impl ContractDraft {
    /// Draft a contract for an accepted request
    pub fn from_request(
        request: &DataRequest,
        choices: ScopeChoices,
        config: &CapsuleConfig,
        effects: &Effects,
    ) -> Result<Self> {
        let body = &request.body;
        let now = effects.now_ms();
        if request.is_expired(now) {
            return Err(NodeError::ttl_expired(format!(
                "request {} expired",
                body.request_id
            )));
        }
        let duration_secs = choices.duration_secs.unwrap_or(config.default_contract_secs);
        let mut draft = Self {
            contract_id: ContractId::generate(effects),
            request_id: body.request_id,
            requester_id: body.requester_id.clone(),
            required_labels: body.scope.required_labels.clone(),
            optional_labels: body.scope.optional_labels.clone(),
            scope: ContractScope {
                labels: body
                    .scope
                    .required_labels
                    .union(&body.scope.optional_labels)
                    .cloned()
                    .collect(),
                record_types: body.scope.record_types.clone(),
                fields: body.scope.fields.clone(),
                time_window: body.scope.time_window,
                output_mode: body.scope.output_mode,
            },
            k_min: body.k_min,
            starts_at_ms: now,
            expires_at_ms: now + config.default_contract_secs.max(duration_secs) * MS_PER_SEC,
            capsule_ttl_secs: config.default_ttl_secs,
            base_price: body.compensation.clone(),
            nonce: hex::encode(effects.random_bytes::<16>()),
            requester_key: body.requester_pubkey,
            requester_agreement_key: body.requester_agreement_key,
        };
        draft.narrow_labels(choices.labels)?;
        draft.narrow_output_mode(choices.output_mode)?;
        draft.narrow_duration(duration_secs)?;
        Ok(draft)
    }

    /// Restrict the shared labels
    pub fn narrow_labels(&mut self, labels: BTreeSet<String>) -> Result<()> {
        if let Some(extra) = labels.difference(&self.scope.labels).next() {
            return Err(NodeError::validation(format!(
                "label {extra} is outside the offered scope"
            )));
        }
        if let Some(missing) = self.required_labels.difference(&labels).next() {
            return Err(NodeError::validation(format!(
                "required label {missing} cannot be removed"
            )));
        }
        self.scope.labels = labels;
        Ok(())
    }

    /// Restrict the output mode
    pub fn narrow_output_mode(&mut self, mode: OutputMode) -> Result<()> {
        if !mode.is_narrower_or_equal(self.scope.output_mode) {
            return Err(NodeError::validation(format!(
                "output mode {mode:?} is broader than {:?}",
                self.scope.output_mode
            )));
        }
        self.scope.output_mode = mode;
        Ok(())
    }

    /// Shorten the contract
    pub fn narrow_duration(&mut self, duration_secs: u64) -> Result<()> {
        if duration_secs == 0 {
            return Err(NodeError::validation("contract duration must be positive"));
        }
        let expires_at_ms = self.starts_at_ms + duration_secs * MS_PER_SEC;
        if expires_at_ms > self.expires_at_ms {
            return Err(NodeError::validation("contract duration can only shrink"));
        }
        self.expires_at_ms = expires_at_ms;
        Ok(())
    }

    /// Price: base plus a bonus proportional to the optional labels shared
    pub fn price(&self) -> Compensation {
        let included = self
            .optional_labels
            .intersection(&self.scope.labels)
            .count() as u64;
        let total = self.optional_labels.len() as u64;
        let bonus = if total == 0 {
            0
        } else {
            self.base_price.amount_cents * MAX_OPTIONAL_BONUS_PERCENT * included / (100 * total)
        };
        Compensation {
            amount_cents: self.base_price.amount_cents + bonus,
            currency: self.base_price.currency.clone(),
        }
    }

    /// Obligations implied by the current scope
    pub fn obligations(&self) -> BTreeSet<Obligation> {
        let mut obligations: BTreeSet<_> = [
            Obligation::NoReidentification,
            Obligation::NoOnwardTransfer,
            Obligation::DeleteOnExpiry,
        ]
        .into_iter()
        .collect();
        if self.scope.output_mode == OutputMode::AggregateOnly {
            obligations.insert(Obligation::AggregateResultsOnly);
        }
        obligations
    }

    /// Current scope
    pub fn scope(&self) -> &ContractScope {
        &self.scope
    }

    /// Terms as they would be signed with `ds_key`
    pub fn terms(&self, ds_key: PublicKey) -> ContractTerms {
        ContractTerms {
            contract_id: self.contract_id,
            request_id: self.request_id,
            requester_id: self.requester_id.clone(),
            scope: self.scope.clone(),
            k_min: self.k_min,
            starts_at_ms: self.starts_at_ms,
            expires_at_ms: self.expires_at_ms,
            capsule_ttl_secs: self.capsule_ttl_secs,
            price: self.price(),
            obligations: self.obligations(),
            nonce: self.nonce.clone(),
            ds_key,
            requester_key: self.requester_key,
            requester_agreement_key: self.requester_agreement_key,
        }
    }

    /// Sign with the pairwise key for the requester
    pub fn ds_sign(self, keyring: &KeyRing) -> Result<SingleSignedContract> {
        let ds_key = keyring.pairwise(&self.requester_id)?;
        let terms = self.terms(ds_key);
        let ds_signature = keyring.sign_pairwise(&self.requester_id, &terms.signing_message()?)?;
        Ok(SingleSignedContract {
            terms,
            ds_signature,
        })
    }
}

/// Contract signed by the device, awaiting the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleSignedContract {
    /// Signed terms
    pub terms: ContractTerms,
    /// Device signature
    pub ds_signature: SignatureBytes,
}

impl SingleSignedContract {
    /// Activate with the requester's countersignature
    pub fn countersign(self, requester_signature: SignatureBytes) -> Result<ActiveContract> {
        ActiveContract::try_from(ContractRecord {
            terms: self.terms,
            ds_signature: self.ds_signature,
            requester_signature,
        })
    }
}

/// Serialized form of an active contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    /// Terms
    pub terms: ContractTerms,
    /// Device signature
    pub ds_signature: SignatureBytes,
    /// Requester signature
    pub requester_signature: SignatureBytes,
}

/// Dual-signed contract. Read-only; deserialization re-verifies both signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ContractRecord", into = "ContractRecord")]
pub struct ActiveContract {
    terms: ContractTerms,
    ds_signature: SignatureBytes,
    requester_signature: SignatureBytes,
    contract_hash: Digest,
}

impl TryFrom<ContractRecord> for ActiveContract {
    type Error = NodeError;

    fn try_from(record: ContractRecord) -> Result<Self> {
        let message = record.terms.signing_message()?;
        verify_signature(&record.terms.ds_key, &message, &record.ds_signature)?;
        verify_signature(
            &record.terms.requester_key,
            &message,
            &record.requester_signature,
        )?;
        Ok(Self {
            contract_hash: record.terms.contract_hash()?,
            terms: record.terms,
            ds_signature: record.ds_signature,
            requester_signature: record.requester_signature,
        })
    }
}

impl From<ActiveContract> for ContractRecord {
    fn from(contract: ActiveContract) -> Self {
        Self {
            terms: contract.terms,
            ds_signature: contract.ds_signature,
            requester_signature: contract.requester_signature,
        }
    }
}

impl ActiveContract {
    /// Contract id
    pub fn id(&self) -> ContractId {
        self.terms.contract_id
    }

    /// Signed terms
    pub fn terms(&self) -> &ContractTerms {
        &self.terms
    }

    /// Canonical terms hash
    pub fn contract_hash(&self) -> Digest {
        self.contract_hash
    }

    /// Device signature
    pub fn ds_signature(&self) -> SignatureBytes {
        self.ds_signature
    }

    /// Requester signature
    pub fn requester_signature(&self) -> SignatureBytes {
        self.requester_signature
    }

    /// Whether `now_ms` falls inside the validity period
    pub fn is_active_at(&self, now_ms: u64) -> bool {
        now_ms >= self.terms.starts_at_ms && now_ms < self.terms.expires_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::fixtures::body;
    use assert_matches::assert_matches;
    use yachaq_crypto::SigningIdentity;

    const T0: u64 = 1_772_447_400_000;

    fn setup() -> (Effects, KeyRing, SigningIdentity, DataRequest) {
        let (effects, _) = Effects::deterministic(8, T0);
        let keyring = KeyRing::generate(&effects);
        let requester = SigningIdentity::generate(&effects);
        let request =
            DataRequest::sign(body(&effects, &requester, "has(mobility.trip)"), &requester)
                .unwrap();
        (effects, keyring, requester, request)
    }

    #[test]
    fn test_dual_signed_lifecycle() {
        let (effects, keyring, requester, request) = setup();
        let draft = ContractDraft::from_request(
            &request,
            ScopeChoices::accept_all(&request),
            &CapsuleConfig::default(),
            &effects,
        )
        .unwrap();
        let single = draft.ds_sign(&keyring).unwrap();
        assert_eq!(single.terms.ds_key, keyring.pairwise("acme-research").unwrap());
        assert_ne!(single.terms.ds_key, keyring.root_public());

        let signature = requester.sign(&single.terms.signing_message().unwrap());
        let active = single.countersign(signature).unwrap();
        assert!(active.is_active_at(T0));
        assert!(!active.is_active_at(active.terms().expires_at_ms));
        assert_eq!(active.contract_hash(), active.terms().contract_hash().unwrap());
    }

    #[test]
    fn test_countersign_requires_requester_key() {
        let (effects, keyring, _, request) = setup();
        let single = ContractDraft::from_request(
            &request,
            ScopeChoices::accept_all(&request),
            &CapsuleConfig::default(),
            &effects,
        )
        .unwrap()
        .ds_sign(&keyring)
        .unwrap();
        let impostor = SigningIdentity::generate(&effects);
        let signature = impostor.sign(&single.terms.signing_message().unwrap());
        assert_matches!(
            single.countersign(signature),
            Err(NodeError::IntegrityFailure { .. })
        );
    }

    #[test]
    fn test_tampered_record_fails_to_load() {
        let (effects, keyring, requester, request) = setup();
        let single = ContractDraft::from_request(
            &request,
            ScopeChoices::accept_all(&request),
            &CapsuleConfig::default(),
            &effects,
        )
        .unwrap()
        .ds_sign(&keyring)
        .unwrap();
        let signature = requester.sign(&single.terms.signing_message().unwrap());
        let active = single.countersign(signature).unwrap();

        let json = serde_json::to_string(&active).unwrap();
        let back: ActiveContract = serde_json::from_str(&json).unwrap();
        assert_eq!(back, active);

        let tampered = json.replace("aggregate_only", "export_allowed");
        assert!(serde_json::from_str::<ActiveContract>(&tampered).is_err());
    }

    #[test]
    fn test_narrowing_only() {
        let (effects, _, _, request) = setup();
        let mut draft = ContractDraft::from_request(
            &request,
            ScopeChoices::accept_all(&request),
            &CapsuleConfig::default(),
            &effects,
        )
        .unwrap();
        assert_matches!(
            draft.narrow_output_mode(OutputMode::ExportAllowed),
            Err(NodeError::Validation { .. })
        );
        assert_matches!(
            draft.narrow_labels(["mode:cycle".to_string()].into_iter().collect()),
            Err(NodeError::Validation { .. })
        );
        assert_matches!(
            draft.narrow_labels(
                ["mobility:trip".to_string(), "health:steps".to_string()]
                    .into_iter()
                    .collect()
            ),
            Err(NodeError::Validation { .. })
        );
        assert_matches!(
            draft.narrow_duration(365 * 86_400),
            Err(NodeError::Validation { .. })
        );
        draft.narrow_duration(3_600).unwrap();
        assert!(draft.obligations().contains(&Obligation::AggregateResultsOnly));
    }

    #[test]
    fn test_optional_label_bonus() {
        let (effects, _, _, request) = setup();
        let mut draft = ContractDraft::from_request(
            &request,
            ScopeChoices::accept_all(&request),
            &CapsuleConfig::default(),
            &effects,
        )
        .unwrap();
        // one optional label of one: full 20% bonus
        assert_eq!(draft.price().amount_cents, 600);
        draft
            .narrow_labels(["mobility:trip".to_string()].into_iter().collect())
            .unwrap();
        assert_eq!(draft.price().amount_cents, 500);
    }

    #[test]
    fn test_field_wildcards() {
        let (effects, _, _, request) = setup();
        let draft = ContractDraft::from_request(
            &request,
            ScopeChoices::accept_all(&request),
            &CapsuleConfig::default(),
            &effects,
        )
        .unwrap();
        let scope = draft.scope();
        assert!(scope.allows_field("attr.distance_m"));
        assert!(scope.allows_field("event.t_start"));
        assert!(!scope.allows_field("event.source"));
        assert!(scope.allows_record_type("trip"));
        assert!(!scope.allows_record_type("heart_rate"));
    }
}
