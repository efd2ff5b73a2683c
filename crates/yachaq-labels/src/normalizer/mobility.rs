use super::{coarse_geo, optional_f64, required_u64, vocab_code, Normalizer, RawContext};
use crate::event::{AttributeValue, CanonicalEvent, EventCategory};
use serde_json::Value;
use yachaq_core::Result;

/// Transport modes
pub const MODES: &[&str] = &["walk", "run", "cycle", "transit", "drive", "flight", "other"];

const MODE_SYNONYMS: &[(&str, &str)] = &[
    ("walk", "walk"),
    ("walking", "walk"),
    ("run", "run"),
    ("running", "run"),
    ("cycle", "cycle"),
    ("cycling", "cycle"),
    ("bike", "cycle"),
    ("bicycle", "cycle"),
    ("transit", "transit"),
    ("bus", "transit"),
    ("train", "transit"),
    ("subway", "transit"),
    ("metro", "transit"),
    ("drive", "drive"),
    ("driving", "drive"),
    ("car", "drive"),
    ("taxi", "drive"),
    ("flight", "flight"),
    ("plane", "flight"),
];

/// Trips and visits.
///
/// Trip fields: `start_ms`, `end_ms`, `distance_m`, `mode`, and optional
/// `country`/`region`/`lat`/`lon`. Visits use `start_ms`/`end_ms` and location.
/// Place names, addresses and notes are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MobilityNormalizer;

impl Normalizer for MobilityNormalizer {
    fn source(&self) -> &str {
        "mobility"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn record_types(&self) -> &[&'static str] {
        &["trip", "visit"]
    }

    fn normalize(&self, ctx: &RawContext, raw: &Value) -> Result<CanonicalEvent> {
        let start = required_u64(raw, "start_ms")?;
        let end = raw.get("end_ms").and_then(Value::as_u64).unwrap_or(start);
        let mut event = CanonicalEvent::new(
            &ctx.source,
            EventCategory::Mobility,
            &ctx.record_type,
            ctx.raw_ref.clone(),
            &ctx.content_hash,
            start,
            end,
        )?;
        event.coarse_geo_cell = coarse_geo(raw)?;
        event.set(
            "duration_s",
            AttributeValue::number(event.duration_secs() as f64)?,
        );

        if ctx.record_type == "trip" {
            if let Some(distance) = optional_f64(raw, "distance_m")? {
                event.set("distance_m", AttributeValue::number(distance.max(0.0))?);
            }
            let mode = vocab_code(raw, "mode", MODE_SYNONYMS);
            event.set("mode", AttributeValue::code(mode, MODES)?);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yachaq_core::{Effects, RawRef};

    fn ctx(record_type: &str) -> RawContext {
        let (effects, _) = Effects::deterministic(3, 0);
        RawContext {
            raw_ref: RawRef::generate(&effects),
            source: "strava".into(),
            record_type: record_type.into(),
            content_hash: "00".into(),
        }
    }

    #[test]
    fn test_trip_normalization() {
        let raw = json!({
            "start_ms": 1_772_447_400_000u64,
            "end_ms": 1_772_449_200_000u64,
            "distance_m": 5400.0,
            "mode": "Bike",
            "country": "PE", "region": "LIM", "lat": -12.0464, "lon": -77.0428,
            "note": "coffee with Ana at 5th avenue",
        });
        let event = MobilityNormalizer.normalize(&ctx("trip"), &raw).unwrap();
        assert_eq!(event.code("mode"), Some("cycle"));
        assert_eq!(event.number("distance_m"), Some(5400.0));
        assert_eq!(event.number("duration_s"), Some(1800.0));
        assert_eq!(
            event.coarse_geo_cell.as_ref().map(|c| c.as_str()),
            Some("PE:LIM:-12.0,-77.0")
        );
        assert!(!event.attributes.contains_key("note"));
    }

    #[test]
    fn test_unknown_mode_maps_to_other() {
        let raw = json!({"start_ms": 1000u64, "mode": "hoverboard"});
        let event = MobilityNormalizer.normalize(&ctx("trip"), &raw).unwrap();
        assert_eq!(event.code("mode"), Some("other"));
    }

    #[test]
    fn test_missing_start_rejected() {
        let raw = json!({"mode": "walk"});
        assert!(MobilityNormalizer.normalize(&ctx("trip"), &raw).is_err());
    }
}
