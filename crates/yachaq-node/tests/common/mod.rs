//! Shared harness: a runtime seeded with trips plus its simulated
//! requester and policy authority.

#![allow(dead_code)]

use std::sync::Arc;
use yachaq_capsule::TimeCapsule;
use yachaq_consent::{ActiveContract, MatchOutcome, ScopeChoices};
use yachaq_core::config::NodeConfig;
use yachaq_core::{
    AuditEventType, CancellationToken, DeviceState, Effects, ManualClock, Result,
    StaticDeviceState,
};
use yachaq_crypto::PublicKey;
use yachaq_node::Runtime;
use yachaq_testkit::{test_effects, trip_item, weekly_trip_steps, PolicyAuthority, RequesterSim};
use yachaq_transport::{accept, CapsuleReceiver, DeliveryReceipt, MemoryLink};

pub const DESTINATION: &str = "capsules.acme-research.example";
pub const REQUESTER: &str = "acme-research";

pub struct Node {
    pub runtime: Runtime,
    pub effects: Effects,
    pub clock: Arc<ManualClock>,
    pub device: Arc<StaticDeviceState>,
    pub authority: PolicyAuthority,
    pub requester: RequesterSim,
}

/// Runtime with default config holding `trips` trips; [`DESTINATION`] is
/// registered with the gate
pub fn node(seed: u64, trips: u64) -> Node {
    node_with(seed, trips, NodeConfig::default())
}

pub fn node_with(seed: u64, trips: u64, config: NodeConfig) -> Node {
    let (effects, clock) = test_effects(seed);
    let device = Arc::new(StaticDeviceState::new(DeviceState::default()));
    let authority = PolicyAuthority::new(&effects);
    let requester = RequesterSim::new(REQUESTER, &effects);
    let runtime = Runtime::builder(config)
        .with_effects(effects.clone())
        .with_device(device.clone())
        .trust_authority(authority.public_key())
        .build()
        .unwrap();
    runtime
        .register_destination(DESTINATION, "capsule delivery")
        .unwrap();
    for i in 0..trips {
        runtime.ingest(trip_item(i)).unwrap();
    }
    Node {
        runtime,
        effects,
        clock,
        device,
        authority,
        requester,
    }
}

impl Node {
    /// Receive, match, accept and countersign the weekly-trips request
    pub fn contract(&self) -> ActiveContract {
        let request = self
            .authority
            .stamp(self.requester.sign_request(self.requester.trip_request_body()));
        let choices = ScopeChoices::accept_all(&request);
        let request_id = self.runtime.receive_request(request).unwrap();
        let outcome = self.runtime.evaluate(&request_id).unwrap();
        assert!(matches!(outcome, MatchOutcome::Eligible(_)), "{outcome:?}");
        let signed = self.runtime.accept_offer(&request_id, choices).unwrap();
        let signature = self.requester.contract_signature(&signed);
        self.runtime
            .activate_contract(&signed.terms.contract_id, signature)
            .unwrap()
    }

    /// Execute the weekly-trips plan under `contract`
    pub fn capsule(&self, contract: &ActiveContract, ttl_secs: Option<u64>) -> TimeCapsule {
        let plan = self
            .requester
            .sign_plan(contract.id(), weekly_trip_steps(ttl_secs));
        let (validated, _) = self.runtime.preview_plan(&plan).unwrap();
        self.runtime
            .execute_plan(&validated, &CancellationToken::new())
            .unwrap()
    }

    pub fn ds_key(&self, contract: &ActiveContract) -> PublicKey {
        contract.terms().ds_key
    }

    pub fn count(&self, event: AuditEventType) -> usize {
        self.runtime.export_audit().unwrap().of_type(event).len()
    }

    pub fn receiver(&self) -> CapsuleReceiver {
        CapsuleReceiver::new(self.effects.clone(), 1 << 20)
    }

    /// Deliver `capsule` over `device_end` while the requester serves
    /// `requester_end` with `receiver`
    pub async fn deliver(
        &self,
        contract: &ActiveContract,
        capsule: &TimeCapsule,
        receiver: &CapsuleReceiver,
        (device_end, requester_end): (MemoryLink, MemoryLink),
    ) -> (
        Result<DeliveryReceipt>,
        Result<(TimeCapsule, DeliveryReceipt)>,
    ) {
        let ds_key = self.ds_key(contract);
        let session_ttl_ms = self.runtime.config().transport.session_ttl_secs * 1_000;
        let capsule_id = capsule.id();
        let cancel = CancellationToken::new();
        let requester_side = async move {
            let mut session = accept(
                &requester_end,
                self.requester.identity(),
                &ds_key,
                &self.effects,
                session_ttl_ms,
            )
            .await?;
            receiver
                .serve(&requester_end, &mut session, self.requester.identity())
                .await
        };
        tokio::join!(
            self.runtime
                .deliver_capsule(&capsule_id, device_end, DESTINATION, &cancel),
            requester_side,
        )
    }
}
