//! Signed data requests

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use yachaq_core::{to_canonical_bytes, GeoCell, RequestId, Result, TimeWindow};
use yachaq_crypto::{
    sha256, verify_signature, AgreementPublicKey, Digest, PublicKey, SignatureBytes,
    SigningIdentity,
};

/// Domain tag for policy stamps
const STAMP_DOMAIN: &[u8] = b"yachaq-policy-stamp-v1";

/// What the requester may receive, most restrictive first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Aggregates over at least `k_min` records only
    AggregateOnly,
    /// Row-level results viewable in a clean room, never exported
    CleanRoom,
    /// Results may leave the clean room via EXPORT
    ExportAllowed,
}

impl OutputMode {
    /// Whether `self` is at least as restrictive as `other`
    pub fn is_narrower_or_equal(self, other: OutputMode) -> bool {
        self <= other
    }
}

/// Offered compensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    /// Amount in minor units
    pub amount_cents: u64,
    /// ISO currency code
    pub currency: String,
}

/// Data the requester asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestScope {
    /// Labels that must be published
    pub required_labels: BTreeSet<String>,
    /// Labels that improve the match
    pub optional_labels: BTreeSet<String>,
    /// Record types the plan may select
    pub record_types: BTreeSet<String>,
    /// Row fields the plan may reference (`prefix*` wildcards allowed)
    pub fields: BTreeSet<String>,
    /// Data time window
    pub time_window: TimeWindow,
    /// Requested output mode
    pub output_mode: OutputMode,
}

/// Everything the requester signs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    /// Request id
    pub request_id: RequestId,
    /// Requester identifier (pairwise counterparty name)
    pub requester_id: String,
    /// Eligibility predicate source
    pub eligibility_predicate: String,
    /// Requested scope
    pub scope: RequestScope,
    /// Minimum cohort the requester accepts
    pub k_min: u64,
    /// Creation time
    pub created_at_ms: u64,
    /// Expiry time
    pub expires_at_ms: u64,
    /// Single-use nonce, hex
    pub nonce: String,
    /// Requester Ed25519 key
    pub requester_pubkey: PublicKey,
    /// Requester X25519 key for capsule sealing
    pub requester_agreement_key: AgreementPublicKey,
    /// Rotating geo topic, when the request targets one
    pub geo_topic: Option<String>,
    /// Optional coarse target area
    pub target_area: Option<GeoCell>,
    /// Offered compensation
    pub compensation: Compensation,
}

impl RequestBody {
    /// Canonical bytes the requester signs
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self)
    }

    /// Digest of the canonical body
    pub fn digest(&self) -> Result<Digest> {
        Ok(sha256(&self.signing_bytes()?))
    }
}

/// Approval of a request body by a policy authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStamp {
    /// Authority key
    pub authority: PublicKey,
    /// When the stamp was issued
    pub issued_at_ms: u64,
    /// Signature over the stamp message
    pub signature: SignatureBytes,
}

impl PolicyStamp {
    /// Issue a stamp for `body`
    pub fn issue(authority: &SigningIdentity, body: &RequestBody, issued_at_ms: u64) -> Result<Self> {
        let message = stamp_message(body, issued_at_ms)?;
        Ok(Self {
            authority: authority.public_key(),
            issued_at_ms,
            signature: authority.sign(&message),
        })
    }

    /// Verify the stamp against `body`
    pub fn verify(&self, body: &RequestBody) -> Result<()> {
        let message = stamp_message(body, self.issued_at_ms)?;
        verify_signature(&self.authority, &message, &self.signature)
    }
}

fn stamp_message(body: &RequestBody, issued_at_ms: u64) -> Result<Vec<u8>> {
    let digest = body.digest()?;
    let mut message = Vec::with_capacity(STAMP_DOMAIN.len() + 40);
    message.extend_from_slice(STAMP_DOMAIN);
    message.extend_from_slice(digest.as_bytes());
    message.extend_from_slice(&issued_at_ms.to_be_bytes());
    Ok(message)
}

/// A signed, stamped data request as received from the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Signed body
    #[serde(flatten)]
    pub body: RequestBody,
    /// Policy authority stamp
    pub policy_stamp: Option<PolicyStamp>,
    /// Requester signature over the body
    pub signature: SignatureBytes,
}

impl DataRequest {
    /// Sign `body` with the requester identity
    pub fn sign(body: RequestBody, requester: &SigningIdentity) -> Result<Self> {
        let signature = requester.sign(&body.signing_bytes()?);
        Ok(Self {
            body,
            policy_stamp: None,
            signature,
        })
    }

    /// Attach a policy stamp
    pub fn with_stamp(mut self, stamp: PolicyStamp) -> Self {
        self.policy_stamp = Some(stamp);
        self
    }

    /// Request id
    pub fn id(&self) -> RequestId {
        self.body.request_id
    }

    /// Verify the requester signature
    pub fn verify_signature(&self) -> Result<()> {
        verify_signature(
            &self.body.requester_pubkey,
            &self.body.signing_bytes()?,
            &self.signature,
        )
    }

    /// Whether the request has expired at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.body.expires_at_ms
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use yachaq_core::Effects;

    pub(crate) fn body(effects: &Effects, requester: &SigningIdentity, predicate: &str) -> RequestBody {
        let now = effects.now_ms();
        RequestBody {
            request_id: RequestId::generate(effects),
            requester_id: "acme-research".into(),
            eligibility_predicate: predicate.into(),
            scope: RequestScope {
                required_labels: ["mobility:trip".to_string()].into_iter().collect(),
                optional_labels: ["mode:cycle".to_string()].into_iter().collect(),
                record_types: ["trip".to_string()].into_iter().collect(),
                fields: ["event.t_start".to_string(), "attr.*".to_string()]
                    .into_iter()
                    .collect(),
                time_window: TimeWindow {
                    start_ms: now.saturating_sub(90 * 86_400_000),
                    end_ms: now,
                },
                output_mode: OutputMode::AggregateOnly,
            },
            k_min: 50,
            created_at_ms: now,
            expires_at_ms: now + 3_600_000,
            nonce: hex::encode(effects.random_bytes::<16>()),
            requester_pubkey: requester.public_key(),
            requester_agreement_key: AgreementPublicKey([9u8; 32]),
            geo_topic: None,
            target_area: None,
            compensation: Compensation {
                amount_cents: 500,
                currency: "USD".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::body;
    use super::*;
    use yachaq_core::{Effects, NodeError};

    #[test]
    fn test_sign_and_verify() {
        let (effects, _) = Effects::deterministic(1, 1_772_447_400_000);
        let requester = SigningIdentity::generate(&effects);
        let request = DataRequest::sign(body(&effects, &requester, "mobility.trip_count > 10"), &requester)
            .unwrap();
        request.verify_signature().unwrap();

        let mut tampered = request.clone();
        tampered.body.k_min = 2;
        assert!(matches!(
            tampered.verify_signature(),
            Err(NodeError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn test_policy_stamp_binds_body() {
        let (effects, _) = Effects::deterministic(2, 1_772_447_400_000);
        let requester = SigningIdentity::generate(&effects);
        let authority = SigningIdentity::generate(&effects);
        let body = body(&effects, &requester, "has(mobility.trip)");
        let stamp = PolicyStamp::issue(&authority, &body, 1).unwrap();
        stamp.verify(&body).unwrap();
        let mut other = body.clone();
        other.scope.output_mode = OutputMode::ExportAllowed;
        assert!(stamp.verify(&other).is_err());
    }

    #[test]
    fn test_output_mode_order() {
        assert!(OutputMode::AggregateOnly.is_narrower_or_equal(OutputMode::ExportAllowed));
        assert!(!OutputMode::ExportAllowed.is_narrower_or_equal(OutputMode::CleanRoom));
    }

    #[test]
    fn test_wire_format_flattens_body() {
        let (effects, _) = Effects::deterministic(3, 1_772_447_400_000);
        let requester = SigningIdentity::generate(&effects);
        let request = DataRequest::sign(body(&effects, &requester, "has(mobility.trip)"), &requester)
            .unwrap();
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("request_id").is_some());
        assert!(value.get("signature").is_some());
        let back: DataRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }
}
