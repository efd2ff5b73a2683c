//! In-process run of the weekly-trips scenario.
//!
//! A simulated requester asks for the average number of trips per week over a
//! device holding sixty-two trips. The device matches, signs, executes, packs
//! and delivers over an in-memory link; the requester opens the capsule.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use yachaq_audit::AuditLog;
use yachaq_consent::{MatchOutcome, ScopeChoices};
use yachaq_core::config::NodeConfig;
use yachaq_core::{AuditEventType, CancellationToken, NodeError, Result};
use yachaq_testkit::{test_effects, trip_item, weekly_trip_steps, PolicyAuthority, RequesterSim};
use yachaq_transport::{accept, CapsuleReceiver, MemoryLink, ReceiptStatus};

/// Requester endpoint registered with the network gate
pub const DESTINATION: &str = "capsules.acme-research.example";

const TRIPS: u64 = 62;

/// What the run produced
#[derive(Debug, Clone)]
pub struct DemoReport {
    /// Device node id
    pub node_id: String,
    /// Match score of the offer
    pub score: f64,
    /// Value the requester read from the capsule
    pub avg_trips_per_week: Value,
    /// Capsule lifetime
    pub capsule_ttl_secs: u64,
    /// Chunks in the transfer manifest
    pub chunks: u32,
    /// Audit event types in chain order
    pub audit: Vec<AuditEventType>,
    /// Whether the exported chain verified
    pub chain_valid: bool,
}

/// Run the scenario with deterministic effects seeded by `seed`
pub async fn run(config: NodeConfig, seed: u64) -> Result<DemoReport> {
    let (effects, _clock) = test_effects(seed);
    let authority = PolicyAuthority::new(&effects);
    let requester = RequesterSim::new("acme-research", &effects);
    let runtime = crate::Runtime::builder(config)
        .with_effects(effects.clone())
        .trust_authority(authority.public_key())
        .build()?;

    for index in 0..TRIPS {
        runtime.ingest(trip_item(index))?;
    }

    let request = authority.stamp(requester.sign_request(requester.trip_request_body()));
    let choices = ScopeChoices::accept_all(&request);
    let request_id = runtime.receive_request(request)?;
    let score = match runtime.evaluate(&request_id)? {
        MatchOutcome::Eligible(offer) => offer.score,
        other => {
            return Err(NodeError::validation(format!(
                "scenario request not eligible: {other:?}"
            )))
        }
    };

    let signed = runtime.accept_offer(&request_id, choices)?;
    let ds_key = signed.terms.ds_key;
    let contract = runtime.activate_contract(
        &signed.terms.contract_id,
        requester.contract_signature(&signed),
    )?;

    let plan = requester.sign_plan(contract.id(), weekly_trip_steps(None));
    let (validated, preview) = runtime.preview_plan(&plan)?;
    info!(
        plan_id = %preview.plan_id,
        impact = preview.privacy_impact_score,
        output = %preview.output_description,
        "plan preview"
    );
    let cancel = CancellationToken::new();
    let capsule_id = runtime.execute_plan(&validated, &cancel)?.id();

    runtime.register_destination(DESTINATION, "capsule delivery")?;
    let (device_end, requester_end) = MemoryLink::pair();
    let receiver = CapsuleReceiver::new(effects.clone(), 1 << 20);
    let session_ttl_ms = runtime.config().transport.session_ttl_secs * 1_000;
    let requester_side = async {
        let mut session = accept(
            &requester_end,
            requester.identity(),
            &ds_key,
            &effects,
            session_ttl_ms,
        )
        .await?;
        receiver
            .serve(&requester_end, &mut session, requester.identity())
            .await
    };
    let (sent, received) = tokio::join!(
        runtime.deliver_capsule(&capsule_id, device_end, DESTINATION, &cancel),
        requester_side,
    );
    let receipt = sent?;
    let (delivered, _) = received?;
    if receipt.status != ReceiptStatus::Confirmed {
        return Err(NodeError::integrity("receipt not confirmed"));
    }

    let requester_audit = Arc::new(AuditLog::in_memory(effects.clone()));
    let payload = requester.opener(requester_audit).open_json(&delivered, &ds_key)?;

    runtime.shutdown()?;
    let export = runtime.export_audit()?;
    Ok(DemoReport {
        node_id: runtime.keyring().node_id().to_string(),
        score,
        avg_trips_per_week: payload["rows"][0]["avg_trips_per_week"].clone(),
        capsule_ttl_secs: (delivered.header.expires_at_ms - delivered.header.created_at_ms)
            / 1_000,
        chunks: receipt.total_chunks,
        audit: export.event_types(),
        chain_valid: export.verify().is_valid(),
    })
}
