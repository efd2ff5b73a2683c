//! Free text in raw records never reaches labels or derived features

use proptest::prelude::*;
use std::sync::Arc;
use yachaq_audit::AuditLog;
use yachaq_core::Effects;
use yachaq_labels::features::attributes_are_clean;
use yachaq_labels::{validate_no_leakage, IngestPipeline};
use yachaq_vault::{LocalVault, RawItem};

fn free_text() -> impl Strategy<Value = String> {
    "[A-Za-z]{6,12} [A-Za-z]{6,12}@[a-z]{4,8}\\.com"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_free_text_never_labeled(
        note in free_text(),
        mode in "[A-Za-z ]{0,16}",
        start in 1_600_000_000_000u64..1_900_000_000_000u64,
        minutes in 0u64..600,
        distance in 0.0f64..200_000.0,
        lat in -89.0f64..89.0,
        lon in -179.0f64..179.0,
    ) {
        let (effects, _) = Effects::deterministic(42, start);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        let vault = LocalVault::new(audit, effects);
        let raw = serde_json::json!({
            "start_ms": start,
            "end_ms": start + minutes * 60_000,
            "distance_m": distance,
            "mode": mode,
            "country": "PE",
            "region": "LIM",
            "lat": lat,
            "lon": lon,
            "note": note,
            "place_name": note,
        });
        let raw_ref = vault
            .put(RawItem::new("strava", "trip", serde_json::to_vec(&raw).unwrap()))
            .unwrap();
        let event = IngestPipeline::with_defaults().process(&vault, &raw_ref).unwrap();

        let features = event.derived_features.clone().unwrap();
        prop_assert!(validate_no_leakage(&features).is_ok());
        prop_assert!(attributes_are_clean(&event));

        let serialized = serde_json::to_string(&event).unwrap();
        prop_assert!(!serialized.contains(&note));
        prop_assert!(!serialized.contains('@'));
        for label in &event.labels {
            prop_assert!(!label.as_str().contains(&note.to_ascii_lowercase()));
            prop_assert!(!label.as_str().chars().any(|c| c == '.' || c == '-'));
        }
    }
}
