//! Static plan validation
//!
//! Runs entirely on the plan and the contract. Nothing here touches the vault,
//! so a rejected plan has caused zero reads.

use crate::instruction::{Instruction, Opcode};
use crate::plan::QueryPlan;
use std::collections::BTreeSet;
use yachaq_consent::{ActiveContract, OutputMode};
use yachaq_core::config::VmConfig;
use yachaq_core::{ContractId, NodeError, PlanId, ResourceLimits, Result, TimeWindow};
use yachaq_crypto::Digest;

/// Opcodes allowed after the first AGGREGATE in aggregate-only mode
const AFTER_AGGREGATE: [Opcode; 5] = [
    Opcode::Aggregate,
    Opcode::Bucketize,
    Opcode::Project,
    Opcode::Redact,
    Opcode::PackCapsule,
];

/// A plan that passed every static check
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    plan: QueryPlan,
    instructions: Vec<Instruction>,
    window: TimeWindow,
    limits: ResourceLimits,
    max_output_records: u64,
    capsule_ttl_secs: u64,
    output_mode: OutputMode,
    warnings: Vec<String>,
    plan_hash: Digest,
}

impl ValidatedPlan {
    /// Plan id
    pub fn plan_id(&self) -> PlanId {
        self.plan.id()
    }

    /// Contract id
    pub fn contract_id(&self) -> ContractId {
        self.plan.body.contract_id
    }

    /// The signed plan
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Decoded steps
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Effective SELECT window
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Effective limits
    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Effective row cap
    pub fn max_output_records(&self) -> u64 {
        self.max_output_records
    }

    /// Capsule TTL the packager should use
    pub fn capsule_ttl_secs(&self) -> u64 {
        self.capsule_ttl_secs
    }

    /// Output mode granted by the contract
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    /// Non-fatal findings
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Hash of the signed plan body
    pub fn plan_hash(&self) -> Digest {
        self.plan_hash
    }

    /// Whether the plan exports results
    pub fn exports(&self) -> bool {
        self.instructions
            .iter()
            .any(|i| i.opcode() == Opcode::Export)
    }
}

/// Static validator
#[derive(Debug, Clone)]
pub struct PlanValidator {
    config: VmConfig,
}

impl PlanValidator {
    /// Validator with the given VM configuration
    pub fn new(config: VmConfig) -> Self {
        Self { config }
    }

    /// Check `plan` against `contract` at `now_ms`.
    ///
    /// Every failure is collected; the error message lists all of them.
    pub fn validate(
        &self,
        plan: &QueryPlan,
        contract: &ActiveContract,
        now_ms: u64,
    ) -> Result<ValidatedPlan> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let body = &plan.body;
        let terms = contract.terms();

        let mut instructions = Vec::with_capacity(body.steps.len());
        for (index, step) in body.steps.iter().enumerate() {
            match Instruction::decode(step) {
                Ok(instruction) => instructions.push(instruction),
                Err(e) => errors.push(format!("step {index}: {}", message_of(&e))),
            }
        }
        // an undecodable step makes the structural checks meaningless
        if !errors.is_empty() {
            return Err(fail(errors));
        }

        if body.contract_id != contract.id() {
            errors.push(format!(
                "plan is bound to {}, not {}",
                body.contract_id,
                contract.id()
            ));
        }
        if plan.verify(&terms.requester_key).is_err() {
            errors.push("plan signature does not verify against the requester key".into());
        }
        if !self.config.supported_plan_versions.contains(&body.plan_version) {
            errors.push(format!("plan version {} is not supported", body.plan_version));
        }
        if body.expires_at_ms <= body.created_at_ms {
            errors.push("plan expires before it was created".into());
        }
        if now_ms >= body.expires_at_ms {
            errors.push("plan has expired".into());
        }
        if !contract.is_active_at(now_ms) {
            errors.push("contract is not active".into());
        }

        let window = self.check_structure(&instructions, contract, &mut errors);
        self.check_fields(&instructions, contract, &mut errors);

        let limits = body.limits.unwrap_or(self.config.default_limits);
        if !limits.within(&self.config.ceiling) {
            errors.push("requested limits exceed the node ceiling".into());
        } else if !limits.within(&self.config.default_limits) {
            warnings.push("requested limits are above the defaults".into());
        }

        let max_output_records = body
            .max_output_records
            .unwrap_or(self.config.max_output_records);
        if max_output_records == 0 {
            errors.push("max_output_records must be positive".into());
        } else if max_output_records > self.config.max_output_records {
            errors.push(format!(
                "max_output_records {max_output_records} exceeds {}",
                self.config.max_output_records
            ));
        } else if max_output_records > self.config.max_output_records / 2 {
            warnings.push(format!("large output cap of {max_output_records} rows"));
        }

        let mut capsule_ttl_secs = terms.capsule_ttl_secs;
        if let Some(Instruction::PackCapsule {
            ttl_secs: Some(ttl),
        }) = instructions.last()
        {
            if *ttl == 0 || *ttl > terms.capsule_ttl_secs {
                errors.push(format!(
                    "capsule ttl {ttl}s is outside the contract's {}s",
                    terms.capsule_ttl_secs
                ));
            }
            capsule_ttl_secs = *ttl;
        }

        if !errors.is_empty() {
            return Err(fail(errors));
        }
        Ok(ValidatedPlan {
            plan: plan.clone(),
            instructions,
            window: window.unwrap_or(terms.scope.time_window),
            limits,
            max_output_records,
            capsule_ttl_secs,
            output_mode: terms.scope.output_mode,
            warnings,
            plan_hash: plan.plan_hash()?,
        })
    }

    /// Ordering, mode and SELECT checks; returns the SELECT window
    fn check_structure(
        &self,
        instructions: &[Instruction],
        contract: &ActiveContract,
        errors: &mut Vec<String>,
    ) -> Option<TimeWindow> {
        let scope = &contract.terms().scope;
        let opcodes: Vec<Opcode> = instructions.iter().map(Instruction::opcode).collect();
        let position = |op: Opcode| opcodes.iter().position(|o| *o == op);

        if opcodes.first() != Some(&Opcode::Select) {
            errors.push("plan must start with SELECT".into());
        }
        if opcodes.iter().filter(|o| **o == Opcode::Select).count() > 1 {
            errors.push("plan must contain exactly one SELECT".into());
        }
        if opcodes.last() != Some(&Opcode::PackCapsule) {
            errors.push("plan must end with PACK_CAPSULE".into());
        }
        if opcodes.iter().filter(|o| **o == Opcode::PackCapsule).count() > 1 {
            errors.push("plan must contain exactly one PACK_CAPSULE".into());
        }

        if let Some(export) = position(Opcode::Export) {
            if scope.output_mode != OutputMode::ExportAllowed {
                errors.push("contract does not permit EXPORT".into());
            }
            if export + 2 != opcodes.len() {
                errors.push("EXPORT must come immediately before PACK_CAPSULE".into());
            }
        }

        if scope.output_mode == OutputMode::AggregateOnly {
            match position(Opcode::Aggregate) {
                None => errors.push("aggregate-only contract requires AGGREGATE".into()),
                Some(first) => {
                    if let Some(op) = opcodes[first..]
                        .iter()
                        .find(|op| !AFTER_AGGREGATE.contains(op))
                    {
                        errors.push(format!("{op} is not allowed after AGGREGATE"));
                    }
                }
            }
        }

        let mut window = None;
        if let Some(Instruction::Select {
            record_types,
            window: requested,
        }) = instructions.first()
        {
            for record_type in record_types {
                if !scope.allows_record_type(record_type) {
                    errors.push(format!("record type {record_type} is outside the contract"));
                }
            }
            if let Some(requested) = requested {
                if !scope.time_window.covers(requested) {
                    errors.push(format!(
                        "window {requested} is outside the contract window {}",
                        scope.time_window
                    ));
                }
                window = Some(*requested);
            }
        }
        window
    }

    /// Every read field must be in scope or produced by an earlier step.
    ///
    /// Aggregate-only plans may group only by derived fields, so a group key
    /// is never a raw record value.
    fn check_fields(
        &self,
        instructions: &[Instruction],
        contract: &ActiveContract,
        errors: &mut Vec<String>,
    ) {
        let scope = &contract.terms().scope;
        let aggregate_only = scope.output_mode == OutputMode::AggregateOnly;
        let mut derived: BTreeSet<&str> = BTreeSet::new();
        for instruction in instructions {
            for field in instruction.input_fields() {
                if !derived.contains(&field) && !scope.allows_field(field) {
                    errors.push(format!(
                        "{} reads {field}, which is outside the contract",
                        instruction.opcode()
                    ));
                }
            }
            if let Instruction::Aggregate { group_by, .. } = instruction {
                for key in group_by {
                    if aggregate_only && !derived.contains(key.as_str()) {
                        errors.push(format!(
                            "AGGREGATE groups by raw field {key}; aggregate-only plans \
                             must group by a BUCKETIZE or CLUSTER_REF output"
                        ));
                    }
                }
            }
            derived.extend(instruction.output_fields());
        }
    }
}

fn message_of(error: &NodeError) -> String {
    match error {
        NodeError::Validation { message } => message.clone(),
        other => other.to_string(),
    }
}

fn fail(errors: Vec<String>) -> NodeError {
    NodeError::validation(format!("plan rejected: {}", errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanBody, PlanStep};
    use crate::testing::{contract_with, trip_plan_steps, Parties, T0};
    use serde_json::json;

    fn plan(parties: &Parties, contract: &ActiveContract, steps: Vec<PlanStep>) -> QueryPlan {
        let body = PlanBody {
            plan_id: PlanId::generate(&parties.effects),
            contract_id: contract.id(),
            plan_version: 1,
            steps,
            limits: None,
            max_output_records: None,
            created_at_ms: T0,
            expires_at_ms: T0 + 3_600_000,
        };
        QueryPlan::sign(body, &parties.requester).unwrap()
    }

    fn validator() -> PlanValidator {
        PlanValidator::new(VmConfig::default())
    }

    fn rejection(result: Result<ValidatedPlan>) -> String {
        match result {
            Err(NodeError::Validation { message }) => message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_trip_plan_is_valid() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let plan = plan(&parties, &contract, trip_plan_steps());
        let validated = validator().validate(&plan, &contract, T0).unwrap();
        assert_eq!(validated.instructions().len(), 5);
        assert_eq!(validated.capsule_ttl_secs(), 86_400);
        assert!(validated.warnings().is_empty());
        assert!(!validated.exports());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let mut steps = trip_plan_steps();
        steps.insert(1, PlanStep::new("EXEC_ARBITRARY", json!({"code": "rm -rf /"})));
        let message = rejection(validator().validate(&plan(&parties, &contract, steps), &contract, T0));
        assert!(message.contains("EXEC_ARBITRARY"));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let mut plan = plan(&parties, &contract, trip_plan_steps());
        plan.body.max_output_records = Some(10);
        let message = rejection(validator().validate(&plan, &contract, T0));
        assert!(message.contains("signature"));
    }

    #[test]
    fn test_ordering_rules() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let mut steps = trip_plan_steps();
        steps.swap(0, 1);
        steps.pop();
        let message = rejection(validator().validate(&plan(&parties, &contract, steps), &contract, T0));
        assert!(message.contains("start with SELECT"));
        assert!(message.contains("end with PACK_CAPSULE"));
    }

    #[test]
    fn test_aggregate_only_requires_aggregate() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let steps = vec![
            PlanStep::new("SELECT", json!({"record_types": ["trip"]})),
            PlanStep::new("PROJECT", json!({"fields": ["attr.distance_m"]})),
            PlanStep::new("PACK_CAPSULE", json!({})),
        ];
        let message = rejection(validator().validate(&plan(&parties, &contract, steps), &contract, T0));
        assert!(message.contains("requires AGGREGATE"));
    }

    #[test]
    fn test_export_needs_permission() {
        let parties = Parties::new();
        let steps = vec![
            PlanStep::new("SELECT", json!({"record_types": ["trip"]})),
            PlanStep::new("PROJECT", json!({"fields": ["attr.distance_m"]})),
            PlanStep::new("EXPORT", json!({})),
            PlanStep::new("PACK_CAPSULE", json!({})),
        ];
        let clean_room = contract_with(&parties, OutputMode::CleanRoom);
        let message = rejection(validator().validate(
            &plan(&parties, &clean_room, steps.clone()),
            &clean_room,
            T0,
        ));
        assert!(message.contains("does not permit EXPORT"));

        let export = contract_with(&parties, OutputMode::ExportAllowed);
        let validated = validator()
            .validate(&plan(&parties, &export, steps), &export, T0)
            .unwrap();
        assert!(validated.exports());
    }

    #[test]
    fn test_out_of_scope_field_and_record_type() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::CleanRoom);
        let steps = vec![
            PlanStep::new("SELECT", json!({"record_types": ["trip", "heart_rate"]})),
            PlanStep::new("PROJECT", json!({"fields": ["event.source"]})),
            PlanStep::new("PACK_CAPSULE", json!({})),
        ];
        let message = rejection(validator().validate(&plan(&parties, &contract, steps), &contract, T0));
        assert!(message.contains("heart_rate"));
        assert!(message.contains("event.source"));
    }

    #[test]
    fn test_derived_fields_are_readable() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        // "week" and "trips" are outside scope but produced by earlier steps
        let validated = validator()
            .validate(&plan(&parties, &contract, trip_plan_steps()), &contract, T0)
            .unwrap();
        assert_eq!(validated.output_mode(), OutputMode::AggregateOnly);
    }

    #[test]
    fn test_aggregate_only_groups_by_derived_fields() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let steps = vec![
            PlanStep::new("SELECT", json!({"record_types": ["trip"]})),
            PlanStep::new(
                "AGGREGATE",
                json!({"function": "min", "field": "attr.distance_m", "group_by": ["event.t_start"], "output": "v"}),
            ),
            PlanStep::new("PACK_CAPSULE", json!({})),
        ];
        let message = rejection(validator().validate(
            &plan(&parties, &contract, steps.clone()),
            &contract,
            T0,
        ));
        assert!(message.contains("raw field event.t_start"));

        // the same grouping is fine when rows never leave the clean room
        let clean_room = contract_with(&parties, OutputMode::CleanRoom);
        validator()
            .validate(&plan(&parties, &clean_room, steps), &clean_room, T0)
            .unwrap();
    }

    #[test]
    fn test_limits_and_ttl() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let mut steps = trip_plan_steps();
        *steps.last_mut().unwrap() = PlanStep::new("PACK_CAPSULE", json!({"ttl_secs": 999_999}));
        let mut body = plan(&parties, &contract, steps).body;
        body.limits = Some(ResourceLimits {
            cpu_ms: 10_000_000,
            ..ResourceLimits::default()
        });
        let plan = QueryPlan::sign(body, &parties.requester).unwrap();
        let message = rejection(validator().validate(&plan, &contract, T0));
        assert!(message.contains("ceiling"));
        assert!(message.contains("capsule ttl"));
    }

    #[test]
    fn test_expired_plan_and_contract() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let plan = plan(&parties, &contract, trip_plan_steps());
        let later = contract.terms().expires_at_ms + 1;
        let message = rejection(validator().validate(&plan, &contract, later));
        assert!(message.contains("plan has expired"));
        assert!(message.contains("contract is not active"));
    }

    #[test]
    fn test_large_cap_warns() {
        let parties = Parties::new();
        let contract = contract_with(&parties, OutputMode::AggregateOnly);
        let mut body = plan(&parties, &contract, trip_plan_steps()).body;
        body.max_output_records = Some(9_000);
        let plan = QueryPlan::sign(body, &parties.requester).unwrap();
        let validated = validator().validate(&plan, &contract, T0).unwrap();
        assert_eq!(validated.warnings().len(), 1);
    }
}
