//! Seeded trip data and the weekly-average plan used across scenario tests

use serde_json::json;
use std::sync::Arc;
use yachaq_consent::{OutputMode, RequestScope};
use yachaq_core::time::MS_PER_DAY;
use yachaq_core::{Effects, ManualClock, RawRef, TimeWindow};
use yachaq_vault::{LocalVault, RawItem};
use yachaq_vm::PlanStep;

/// Monday 2026-03-02 10:30Z
pub const T0: u64 = 1_772_447_400_000;

/// One hour in milliseconds
pub const HOUR_MS: u64 = 3_600_000;

const T0_MIDNIGHT: u64 = T0 - 37_800_000;

/// Deterministic effects starting at [`T0`]
pub fn test_effects(seed: u64) -> (Effects, Arc<ManualClock>) {
    Effects::deterministic(seed, T0)
}

/// Start of trip `index`, spread round-robin over the five weeks before [`T0`]
pub fn trip_start(index: u64) -> u64 {
    let week = index % 5;
    let slot = index / 5;
    T0_MIDNIGHT - (5 - week) * 7 * MS_PER_DAY + MS_PER_DAY + slot * HOUR_MS
}

/// Raw trip record as a fitness connector would deliver it.
///
/// Carries a free-text note that must never surface past the normalizer.
pub fn trip_item(index: u64) -> RawItem {
    let start = trip_start(index);
    let raw = json!({
        "start_ms": start,
        "end_ms": start + 1_500_000,
        "distance_m": 2_000.0 + index as f64,
        "mode": "bike",
        "note": format!("private note {index}"),
    });
    RawItem::new("strava", "trip", raw.to_string().into_bytes())
}

/// Put `count` trips into `vault`.
///
/// Sixty-two trips give weekly counts 13, 13, 12, 12, 12: an average of 12.4.
pub fn seed_trips(vault: &LocalVault, count: u64) -> Vec<RawRef> {
    (0..count)
        .map(|i| vault.put(trip_item(i)).expect("seed trip"))
        .collect()
}

/// Scope asking for weekly trip timing over the last sixty days
pub fn trip_scope(output_mode: OutputMode) -> RequestScope {
    RequestScope {
        required_labels: ["mobility:trip".to_string()].into_iter().collect(),
        optional_labels: Default::default(),
        record_types: ["trip".to_string()].into_iter().collect(),
        fields: ["event.t_start".to_string(), "attr.*".to_string()]
            .into_iter()
            .collect(),
        time_window: TimeWindow::new(T0 - 60 * MS_PER_DAY, T0).expect("window"),
        output_mode,
    }
}

/// SELECT, BUCKETIZE by week, count per week, average the counts, pack
pub fn weekly_trip_steps(ttl_secs: Option<u64>) -> Vec<PlanStep> {
    let pack = match ttl_secs {
        Some(ttl) => json!({ "ttl_secs": ttl }),
        None => json!({}),
    };
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
        PlanStep::new("PACK_CAPSULE", pack),
    ]
}
