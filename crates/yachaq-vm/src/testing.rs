//! Shared unit-test fixtures

use crate::plan::PlanStep;
use crate::row::{event_row, Row};
use serde_json::json;
use std::sync::Arc;
use yachaq_audit::AuditLog;
use yachaq_consent::{
    ActiveContract, Compensation, ContractDraft, DataRequest, OutputMode, RequestBody,
    RequestScope, ScopeChoices,
};
use yachaq_core::config::CapsuleConfig;
use yachaq_core::time::MS_PER_DAY;
use yachaq_core::{Effects, ManualClock, RawRef, RequestId, TimeWindow};
use yachaq_crypto::{AgreementPublicKey, KeyRing, SigningIdentity};
use yachaq_labels::{AttributeValue, CanonicalEvent, EventCategory};

/// Monday 2026-03-02 10:30Z
pub(crate) const T0: u64 = 1_772_447_400_000;

const T0_MIDNIGHT: u64 = T0 - 37_800_000;
const HOUR: u64 = 3_600_000;

pub(crate) struct Parties {
    pub effects: Effects,
    #[allow(dead_code)]
    pub clock: Arc<ManualClock>,
    pub keyring: KeyRing,
    pub requester: SigningIdentity,
    pub audit: Arc<AuditLog>,
}

impl Parties {
    pub fn new() -> Self {
        let (effects, clock) = Effects::deterministic(21, T0);
        Self {
            keyring: KeyRing::generate(&effects),
            requester: SigningIdentity::generate(&effects),
            audit: Arc::new(AuditLog::in_memory(effects.clone())),
            effects,
            clock,
        }
    }
}

pub(crate) fn contract_with(parties: &Parties, mode: OutputMode) -> ActiveContract {
    let effects = &parties.effects;
    let body = RequestBody {
        request_id: RequestId::generate(effects),
        requester_id: "acme-research".into(),
        eligibility_predicate: "mobility.trip_count > 10".into(),
        scope: RequestScope {
            required_labels: ["mobility:trip".to_string()].into_iter().collect(),
            optional_labels: Default::default(),
            record_types: ["trip".to_string()].into_iter().collect(),
            fields: ["event.t_start", "attr.*", "feature.*"]
                .into_iter()
                .map(String::from)
                .collect(),
            time_window: TimeWindow::new(T0 - 90 * MS_PER_DAY, T0).unwrap(),
            output_mode: mode,
        },
        k_min: 50,
        created_at_ms: T0,
        expires_at_ms: T0 + HOUR,
        nonce: hex::encode(effects.random_bytes::<16>()),
        requester_pubkey: parties.requester.public_key(),
        requester_agreement_key: AgreementPublicKey([3u8; 32]),
        geo_topic: None,
        target_area: None,
        compensation: Compensation {
            amount_cents: 500,
            currency: "USD".into(),
        },
    };
    let request = DataRequest::sign(body, &parties.requester).unwrap();
    let draft = ContractDraft::from_request(
        &request,
        ScopeChoices::accept_all(&request),
        &CapsuleConfig::default(),
        effects,
    )
    .unwrap();
    let single = draft.ds_sign(&parties.keyring).unwrap();
    let signature = parties
        .requester
        .sign(&single.terms.signing_message().unwrap());
    single.countersign(signature).unwrap()
}

/// Weekly trip averages over the five weeks before T0
pub(crate) fn trip_plan_steps() -> Vec<PlanStep> {
    vec![
        PlanStep::new(
            "SELECT",
            json!({"record_types": ["trip"], "start_ms": T0 - 35 * MS_PER_DAY, "end_ms": T0}),
        ),
        PlanStep::new(
            "BUCKETIZE",
            json!({"field": "event.t_start", "into": "week", "granularity": "week"}),
        ),
        PlanStep::new(
            "AGGREGATE",
            json!({"function": "count", "group_by": ["week"], "output": "trips"}),
        ),
        PlanStep::new(
            "AGGREGATE",
            json!({"function": "avg", "field": "trips", "output": "avg_trips_per_week"}),
        ),
        PlanStep::new("PACK_CAPSULE", json!({})),
    ]
}

/// Start time of trip `index`, spread round-robin over five weeks
pub(crate) fn trip_start(index: u64) -> u64 {
    let week = index % 5;
    let slot = index / 5;
    // Tuesday of each of the five weeks before T0, one hour apart
    T0_MIDNIGHT - (5 - week) * 7 * MS_PER_DAY + MS_PER_DAY + slot * HOUR
}

pub(crate) fn trip_event(effects: &Effects, index: u64) -> CanonicalEvent {
    let start = trip_start(index);
    let mut event = CanonicalEvent::new(
        "strava",
        EventCategory::Mobility,
        "trip",
        RawRef::generate(effects),
        &format!("h{index}"),
        start,
        start + 1_200_000,
    )
    .unwrap();
    event.set(
        "distance_m",
        AttributeValue::number(1_000.0 + index as f64 * 10.0).unwrap(),
    );
    event.set("mode", AttributeValue::code("walk", &["walk"]).unwrap());
    event
}

pub(crate) fn trip_rows(effects: &Effects, count: u64) -> Vec<Row> {
    (0..count)
        .map(|i| event_row(&trip_event(effects, i)).unwrap())
        .collect()
}
