//! Requester simulator: builds requests and plans, countersigns contracts and
//! opens the capsules it receives.

use crate::fixtures::{trip_scope, HOUR_MS};
use std::sync::Arc;
use yachaq_capsule::CapsuleOpener;
use yachaq_consent::{
    ActiveContract, Compensation, DataRequest, OutputMode, RequestBody, RequestScope,
    SingleSignedContract,
};
use yachaq_core::{AuditSink, ContractId, Effects, PlanId, RequestId};
use yachaq_crypto::{
    AgreementPublicKey, AgreementSecret, PublicKey, SignatureBytes, SigningIdentity,
};
use yachaq_vm::{PlanBody, PlanStep, QueryPlan};

/// A research requester with its signing and X25519 keys
pub struct RequesterSim {
    requester_id: String,
    identity: SigningIdentity,
    agreement: [u8; 32],
    effects: Effects,
}

impl RequesterSim {
    /// Requester named `requester_id` with fresh keys
    pub fn new(requester_id: &str, effects: &Effects) -> Self {
        Self {
            requester_id: requester_id.to_string(),
            identity: SigningIdentity::generate(effects),
            agreement: effects.random_bytes(),
            effects: effects.clone(),
        }
    }

    /// Pairwise counterparty name the device derives keys for
    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    /// Ed25519 identity
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Ed25519 public key
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// X25519 key capsules are sealed to
    pub fn agreement_key(&self) -> AgreementPublicKey {
        AgreementSecret::from_bytes(self.agreement).public_key()
    }

    /// Unsigned request body created now, valid for an hour
    pub fn request_body(&self, predicate: &str, scope: RequestScope, k_min: u64) -> RequestBody {
        let now = self.effects.now_ms();
        RequestBody {
            request_id: RequestId::generate(&self.effects),
            requester_id: self.requester_id.clone(),
            eligibility_predicate: predicate.into(),
            scope,
            k_min,
            created_at_ms: now,
            expires_at_ms: now + HOUR_MS,
            nonce: hex::encode(self.effects.random_bytes::<16>()),
            requester_pubkey: self.public_key(),
            requester_agreement_key: self.agreement_key(),
            geo_topic: None,
            target_area: None,
            compensation: Compensation {
                amount_cents: 500,
                currency: "USD".into(),
            },
        }
    }

    /// Aggregate-only request for weekly trip counts, k-min 50
    pub fn trip_request_body(&self) -> RequestBody {
        self.request_body(
            "mobility.trip_count > 10",
            trip_scope(OutputMode::AggregateOnly),
            50,
        )
    }

    /// Sign a request body
    pub fn sign_request(&self, body: RequestBody) -> DataRequest {
        DataRequest::sign(body, &self.identity).expect("sign request")
    }

    /// Signature over a device-signed contract's terms
    pub fn contract_signature(&self, single: &SingleSignedContract) -> SignatureBytes {
        let message = single.terms.signing_message().expect("contract signing message");
        self.identity.sign(&message)
    }

    /// Countersign a device-signed contract
    pub fn countersign(&self, single: SingleSignedContract) -> ActiveContract {
        let signature = self.contract_signature(&single);
        single.countersign(signature).expect("countersign contract")
    }

    /// Sign a plan under `contract_id`, valid for ten minutes
    pub fn sign_plan(&self, contract_id: ContractId, steps: Vec<PlanStep>) -> QueryPlan {
        let now = self.effects.now_ms();
        let body = PlanBody {
            plan_id: PlanId::generate(&self.effects),
            contract_id,
            plan_version: 1,
            steps,
            limits: None,
            max_output_records: Some(100),
            created_at_ms: now,
            expires_at_ms: now + 600_000,
        };
        QueryPlan::sign(body, &self.identity).expect("sign plan")
    }

    /// Capsule opener for this requester's agreement key
    pub fn opener(&self, audit: Arc<dyn AuditSink>) -> CapsuleOpener {
        CapsuleOpener::new(
            AgreementSecret::from_bytes(self.agreement),
            audit,
            self.effects.clone(),
        )
    }
}

impl std::fmt::Debug for RequesterSim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequesterSim")
            .field("requester_id", &self.requester_id)
            .finish_non_exhaustive()
    }
}
