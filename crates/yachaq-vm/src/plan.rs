//! Signed query plans as they arrive on the wire

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use yachaq_core::{to_canonical_bytes, ContractId, PlanId, ResourceLimits, Result};
use yachaq_crypto::{sha256, verify_signature, Digest, PublicKey, SignatureBytes, SigningIdentity};

const PLAN_DOMAIN: &[u8] = b"yachaq-plan-v1";

/// One untyped step; decoding into an instruction happens during validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Opcode name
    pub op: String,
    /// Opcode parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl PlanStep {
    /// Step with parameters from a JSON object
    pub fn new(op: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            op: op.into(),
            params,
        }
    }
}

/// Everything the requester signs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanBody {
    /// Plan id
    pub plan_id: PlanId,
    /// Contract the plan runs under
    pub contract_id: ContractId,
    /// Plan format version
    pub plan_version: u32,
    /// Steps in execution order
    pub steps: Vec<PlanStep>,
    /// Requested limits; VM defaults when absent
    pub limits: Option<ResourceLimits>,
    /// Output row cap; VM default when absent
    pub max_output_records: Option<u64>,
    /// Creation time
    pub created_at_ms: u64,
    /// Expiry time
    pub expires_at_ms: u64,
}

/// A requester-signed plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Signed body
    #[serde(flatten)]
    pub body: PlanBody,
    /// Requester signature over the body
    pub signature: SignatureBytes,
}

impl QueryPlan {
    /// Sign `body`
    pub fn sign(body: PlanBody, signer: &SigningIdentity) -> Result<Self> {
        let signature = signer.sign(&signing_message(&body)?);
        Ok(Self { body, signature })
    }

    /// Plan id
    pub fn id(&self) -> PlanId {
        self.body.plan_id
    }

    /// Hash of the canonical body
    pub fn plan_hash(&self) -> Result<Digest> {
        Ok(sha256(&to_canonical_bytes(&self.body)?))
    }

    /// Verify against the requester key
    pub fn verify(&self, signer: &PublicKey) -> Result<()> {
        verify_signature(signer, &signing_message(&self.body)?, &self.signature)
    }
}

fn signing_message(body: &PlanBody) -> Result<Vec<u8>> {
    let hash = sha256(&to_canonical_bytes(body)?);
    let mut message = Vec::with_capacity(PLAN_DOMAIN.len() + 32);
    message.extend_from_slice(PLAN_DOMAIN);
    message.extend_from_slice(hash.as_bytes());
    Ok(message)
}
