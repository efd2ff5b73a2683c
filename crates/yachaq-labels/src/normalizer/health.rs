use super::{optional_f64, required_u64, vocab_code, Normalizer, RawContext};
use crate::event::{AttributeValue, CanonicalEvent, EventCategory};
use serde_json::Value;
use yachaq_core::{NodeError, Result};

/// Sleep stages
pub const SLEEP_STAGES: &[&str] = &["awake", "light", "deep", "rem", "other"];

/// Workout kinds
pub const WORKOUT_KINDS: &[&str] = &["run", "cycle", "swim", "strength", "walk", "other"];

/// Heart rate measurement context
pub const HR_SETTINGS: &[&str] = &["rest", "active", "sleep", "other"];

const SLEEP_SYNONYMS: &[(&str, &str)] = &[
    ("awake", "awake"),
    ("light", "light"),
    ("core", "light"),
    ("deep", "deep"),
    ("rem", "rem"),
];

const WORKOUT_SYNONYMS: &[(&str, &str)] = &[
    ("run", "run"),
    ("running", "run"),
    ("cycle", "cycle"),
    ("cycling", "cycle"),
    ("ride", "cycle"),
    ("swim", "swim"),
    ("swimming", "swim"),
    ("strength", "strength"),
    ("weights", "strength"),
    ("walk", "walk"),
    ("walking", "walk"),
    ("hike", "walk"),
];

const HR_SYNONYMS: &[(&str, &str)] = &[
    ("rest", "rest"),
    ("resting", "rest"),
    ("active", "active"),
    ("exercise", "active"),
    ("sleep", "sleep"),
];

/// Steps, heart rate, sleep and workouts
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthNormalizer;

impl Normalizer for HealthNormalizer {
    fn source(&self) -> &str {
        "health"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn record_types(&self) -> &[&'static str] {
        &["steps", "heart_rate", "sleep", "workout"]
    }

    fn normalize(&self, ctx: &RawContext, raw: &Value) -> Result<CanonicalEvent> {
        let start = required_u64(raw, "start_ms")?;
        let end = raw.get("end_ms").and_then(Value::as_u64).unwrap_or(start);
        let category = match ctx.record_type.as_str() {
            "workout" | "steps" => EventCategory::Activity,
            _ => EventCategory::Health,
        };
        let mut event = CanonicalEvent::new(
            &ctx.source,
            category,
            &ctx.record_type,
            ctx.raw_ref.clone(),
            &ctx.content_hash,
            start,
            end,
        )?;
        event.set(
            "duration_s",
            AttributeValue::number(event.duration_secs() as f64)?,
        );

        match ctx.record_type.as_str() {
            "steps" => {
                let count = optional_f64(raw, "count")?
                    .ok_or_else(|| NodeError::validation("steps record without count"))?;
                event.set("count", AttributeValue::number(count.max(0.0).round())?);
            }
            "heart_rate" => {
                let bpm = optional_f64(raw, "bpm")?
                    .ok_or_else(|| NodeError::validation("heart rate record without bpm"))?;
                event.set("bpm", AttributeValue::number(bpm)?);
                let context = vocab_code(raw, "context", HR_SYNONYMS);
                event.set("setting", AttributeValue::code(context, HR_SETTINGS)?);
            }
            "sleep" => {
                let stage = vocab_code(raw, "stage", SLEEP_SYNONYMS);
                event.set("stage", AttributeValue::code(stage, SLEEP_STAGES)?);
            }
            "workout" => {
                let kind = vocab_code(raw, "kind", WORKOUT_SYNONYMS);
                event.set("kind", AttributeValue::code(kind, WORKOUT_KINDS)?);
                if let Some(calories) = optional_f64(raw, "calories")? {
                    event.set("calories", AttributeValue::number(calories.max(0.0))?);
                }
                if let Some(distance) = optional_f64(raw, "distance_m")? {
                    event.set("distance_m", AttributeValue::number(distance.max(0.0))?);
                }
            }
            other => {
                return Err(NodeError::validation(format!(
                    "health normalizer cannot handle {other}"
                )))
            }
        }
        Ok(event)
    }
}
