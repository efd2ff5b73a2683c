//! No published entry is below its floor, and every observation is accounted for

use proptest::prelude::*;
use std::sync::Arc;
use yachaq_audit::AuditLog;
use yachaq_core::config::PrivacyConfig;
use yachaq_core::time::MS_PER_DAY;
use yachaq_core::{Effects, GeoCell, RawRef};
use yachaq_labels::{CanonicalEvent, EventCategory, Label};
use yachaq_odx::{OdxBuilder, SchemaScanner};

const CELLS: &[&str] = &[
    "PE:LIM:-12.0,-77.0",
    "PE:LIM:-12.1,-77.0",
    "PE:CUS:-13.5,-72.0",
    "CO:BOG:4.6,-74.1",
    "PE",
];
const FACETS: &[&str] = &["mobility:trip", "mode:cycle", "time:evening", "health:steps"];
// 2026-01-05T00:00:00Z
const BASE: u64 = 1_767_571_200_000;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_floor_and_conservation(
        k_min in 2u64..12,
        observations in prop::collection::vec((0usize..5, 0u64..120, 1u8..16), 1..150),
    ) {
        let (effects, _) = Effects::deterministic(7, BASE);
        let config = PrivacyConfig { k_min, high_sensitivity_k_min: k_min * 2 };
        let odx = OdxBuilder::new(config, Arc::new(AuditLog::in_memory(effects.clone())));
        let mut per_facet = [0u64; 4];

        for (i, (cell, day, mask)) in observations.iter().enumerate() {
            let ts = BASE + day * MS_PER_DAY;
            let mut event = CanonicalEvent::new(
                "strava",
                EventCategory::Mobility,
                "trip",
                RawRef::generate(&effects),
                &i.to_string(),
                ts,
                ts,
            ).unwrap();
            event.coarse_geo_cell = Some(GeoCell::parse(CELLS[*cell]).unwrap());
            for (bit, facet) in FACETS.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    event.labels.insert(Label::parse(facet).unwrap());
                    per_facet[bit] += 1;
                }
            }
            odx.upsert(&event).unwrap();
        }

        for entry in odx.entries() {
            prop_assert!(entry.count() >= entry.privacy_floor);
            prop_assert!(entry.privacy_floor >= k_min);
            prop_assert!(SchemaScanner.scan(&entry).unwrap().is_empty());
        }
        for (bit, facet) in FACETS.iter().enumerate() {
            let floor = odx.floor_for(facet);
            let cohort = odx.cohort(facet, floor);
            prop_assert_eq!(cohort.total(), per_facet[bit]);
            let published: u64 = odx
                .entries()
                .iter()
                .filter(|e| e.facet_key == *facet)
                .map(|e| e.count())
                .sum();
            prop_assert_eq!(cohort.published, published);
        }
        prop_assert_eq!(odx.stats().violations, 0);
    }
}
