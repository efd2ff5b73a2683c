//! Human-readable plan preview

use crate::instruction::{Instruction, Opcode};
use crate::validator::ValidatedPlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use yachaq_consent::OutputMode;
use yachaq_core::{PlanId, ResourceLimits};

/// One previewed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewStep {
    /// Opcode name
    pub op: String,
    /// What the step does
    pub description: String,
    /// Privacy impact of the opcode
    pub privacy_impact: i32,
}

/// What a validated plan will do, shown before execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPreview {
    /// Plan id
    pub plan_id: PlanId,
    /// Steps in order
    pub steps: Vec<PreviewStep>,
    /// Source fields the plan reads
    pub accessed_fields: BTreeSet<String>,
    /// Sum of step impacts, never below zero
    pub privacy_impact_score: u32,
    /// What leaves the VM
    pub output_description: String,
    /// Effective limits
    pub limits: ResourceLimits,
    /// Validator warnings
    pub warnings: Vec<String>,
}

impl PlanPreview {
    /// Build from a validated plan
    pub fn of(plan: &ValidatedPlan) -> Self {
        let steps = plan
            .instructions()
            .iter()
            .map(|instruction| PreviewStep {
                op: instruction.opcode().name().to_string(),
                description: instruction.describe(),
                privacy_impact: instruction.opcode().privacy_impact(),
            })
            .collect::<Vec<_>>();
        let score = steps.iter().map(|s| s.privacy_impact).sum::<i32>().max(0);

        let mut derived = BTreeSet::new();
        let mut accessed_fields = BTreeSet::new();
        for instruction in plan.instructions() {
            for field in instruction.input_fields() {
                if !derived.contains(&field) {
                    accessed_fields.insert(field.to_string());
                }
            }
            derived.extend(instruction.output_fields());
        }

        Self {
            plan_id: plan.plan_id(),
            steps,
            accessed_fields,
            privacy_impact_score: score.unsigned_abs(),
            output_description: output_description(plan),
            limits: plan.limits(),
            warnings: plan.warnings().to_vec(),
        }
    }
}

fn output_description(plan: &ValidatedPlan) -> String {
    let last_aggregate = plan.instructions().iter().rev().find_map(|i| match i {
        Instruction::Aggregate { output, .. } => Some(output.as_str()),
        _ => None,
    });
    let shape = match last_aggregate {
        Some(output) => format!("aggregate {output}"),
        None => "row-level results".to_string(),
    };
    let delivery = if plan.exports() {
        "exported"
    } else {
        match plan.output_mode() {
            OutputMode::CleanRoom => "viewable in a clean room only",
            _ => "sealed to the requester",
        }
    };
    let capped = plan
        .instructions()
        .iter()
        .any(|i| i.opcode() == Opcode::Sample);
    format!(
        "{shape}, at most {} rows{}, {delivery}, in a capsule valid for {}s",
        plan.max_output_records(),
        if capped { " after sampling" } else { "" },
        plan.capsule_ttl_secs()
    )
}
