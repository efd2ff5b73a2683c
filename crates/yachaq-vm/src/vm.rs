//! The query plan interpreter
//!
//! Executes validated plans over rows from a [`RowSource`]. Output is a pure
//! function of the source snapshot, the contract and the plan: rows are sorted
//! after SELECT, grouping is ordered and sampling is seeded by the plan.

use crate::governor::{ResourceGovernor, ResourceUsage};
use crate::instruction::{AggFn, BucketSpec, Instruction};
use crate::plan::QueryPlan;
use crate::preview::PlanPreview;
use crate::row::{number, Row, RowSource};
use crate::validator::{PlanValidator, ValidatedPlan};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use yachaq_consent::{ActiveContract, OutputMode};
use yachaq_core::config::{PrivacyConfig, VmConfig};
use yachaq_core::{
    to_canonical_bytes, AuditEventType, AuditRecord, AuditSink, CancellationToken, ContractId,
    DeviceStateProvider, Effects, EgressLock, NodeError, PlanId, Result,
};
use yachaq_crypto::{sha256, sha256_parts, Digest};

const AVG_PRECISION: f64 = 1e6;

/// Result of one execution, handed to the capsule packager
#[derive(Debug, Clone, PartialEq)]
pub struct VmOutput {
    /// Executed plan
    pub plan_id: PlanId,
    /// Governing contract
    pub contract_id: ContractId,
    /// Field names present in the output, sorted
    pub schema: Vec<String>,
    /// Output rows
    pub rows: Vec<Row>,
    /// Whether the plan exported its results
    pub exportable: bool,
    /// Resource usage of the run
    pub usage: ResourceUsage,
}

impl VmOutput {
    /// The payload that gets sealed
    pub fn payload(&self) -> Value {
        json!({ "schema": self.schema, "rows": self.rows })
    }

    /// Canonical payload bytes
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(&self.payload())
    }

    /// Hash of the canonical payload
    pub fn output_hash(&self) -> Result<Digest> {
        Ok(sha256(&self.canonical_bytes()?))
    }
}

/// The constrained VM
pub struct QueryPlanVm {
    config: VmConfig,
    privacy: PrivacyConfig,
    validator: PlanValidator,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
    device: Arc<dyn DeviceStateProvider>,
    egress: EgressLock,
}

impl QueryPlanVm {
    /// VM sharing the runtime's audit sink, device state and egress lock
    pub fn new(
        config: VmConfig,
        privacy: PrivacyConfig,
        audit: Arc<dyn AuditSink>,
        effects: Effects,
        device: Arc<dyn DeviceStateProvider>,
        egress: EgressLock,
    ) -> Self {
        Self {
            validator: PlanValidator::new(config.clone()),
            config,
            privacy,
            audit,
            effects,
            device,
            egress,
        }
    }

    /// Statically validate; the outcome is audited either way
    pub fn validate(&self, plan: &QueryPlan, contract: &ActiveContract) -> Result<ValidatedPlan> {
        match self.validator.validate(plan, contract, self.effects.now_ms()) {
            Ok(validated) => {
                self.audit.append(
                    AuditRecord::new(AuditEventType::PlanValidated)
                        .with("plan_id", plan.id())
                        .with("contract_id", contract.id())
                        .with("plan_hash", validated.plan_hash().to_hex()),
                )?;
                debug!(plan_id = %plan.id(), warnings = validated.warnings().len(), "plan validated");
                Ok(validated)
            }
            Err(e) => {
                warn!(plan_id = %plan.id(), error = %e, "plan rejected");
                self.audit.append(
                    AuditRecord::new(AuditEventType::PlanRejected)
                        .with("plan_id", plan.id())
                        .with("contract_id", contract.id())
                        .with("reason", &e),
                )?;
                Err(e)
            }
        }
    }

    /// Describe a validated plan for the user
    pub fn preview(&self, plan: &ValidatedPlan) -> PlanPreview {
        PlanPreview::of(plan)
    }

    /// Run a validated plan.
    ///
    /// Network egress stays locked for the whole run. On any failure the partial
    /// rows are dropped and the failure is audited.
    pub fn execute(
        &self,
        plan: &ValidatedPlan,
        contract: &ActiveContract,
        source: &dyn RowSource,
        cancel: &CancellationToken,
    ) -> Result<VmOutput> {
        let _egress = self.egress.lock();
        let mut governor = ResourceGovernor::start(
            plan.limits(),
            self.effects.clone(),
            self.device.clone(),
            cancel.clone(),
        );
        let outcome = self.run(plan, contract, source, &mut governor);
        match outcome {
            Ok(rows) => self.finish(plan, rows, governor.usage()),
            Err(e) => {
                let event = match &e {
                    NodeError::Cancelled { .. } => AuditEventType::ExecutionCancelled,
                    NodeError::ResourceExceeded { .. } => AuditEventType::ResourceExceeded,
                    _ => AuditEventType::PlanRejected,
                };
                warn!(plan_id = %plan.plan_id(), error = %e, "plan execution failed");
                self.audit.append(
                    AuditRecord::new(event)
                        .with("plan_id", plan.plan_id())
                        .with("contract_id", plan.contract_id())
                        .with("reason", &e),
                )?;
                Err(e)
            }
        }
    }

    fn run(
        &self,
        plan: &ValidatedPlan,
        contract: &ActiveContract,
        source: &dyn RowSource,
        governor: &mut ResourceGovernor,
    ) -> Result<Vec<Row>> {
        if contract.id() != plan.contract_id() {
            return Err(NodeError::validation("plan and contract do not match"));
        }
        if !contract.is_active_at(self.effects.now_ms()) {
            return Err(NodeError::ttl_expired(format!(
                "contract {} is no longer active",
                contract.id()
            )));
        }

        let mut exec = Execution {
            governor,
            interval: self.config.checkpoint_interval_rows.max(1),
            memory: 0,
        };
        let mut rows: Vec<Row> = Vec::new();
        let mut aggregated = false;

        for (index, instruction) in plan.instructions().iter().enumerate() {
            let location = format!("step {index} {}", instruction.opcode());
            exec.governor.checkpoint(&location, exec.memory)?;

            match instruction {
                Instruction::Select { record_types, .. } => {
                    rows = source.select(record_types, &plan.window())?;
                    let mut keyed = rows
                        .into_iter()
                        .map(|row| Ok((to_canonical_bytes(&row)?, row)))
                        .collect::<Result<Vec<_>>>()?;
                    keyed.sort_by(|a, b| a.0.cmp(&b.0));
                    rows = keyed.into_iter().map(|(_, row)| row).collect();
                }
                Instruction::Filter { field, op, value } => {
                    exec.scan(&location, &rows)?;
                    rows.retain(|row| row.get(field).is_some_and(|left| op.matches(left, value)));
                }
                Instruction::Project { fields } => {
                    exec.scan(&location, &rows)?;
                    let keep: BTreeSet<&str> = fields.iter().map(String::as_str).collect();
                    for row in &mut rows {
                        row.retain(|key, _| keep.contains(key.as_str()));
                    }
                }
                Instruction::Bucketize { field, into, spec } => {
                    for (i, row) in rows.iter_mut().enumerate() {
                        exec.tick(&location, i)?;
                        if let Some(value) = row.get(field) {
                            let bucket = bucket_of(field, value, spec)?;
                            row.insert(into.clone(), bucket);
                        }
                    }
                }
                Instruction::Aggregate {
                    function,
                    field,
                    group_by,
                    output,
                } => {
                    if !aggregated && plan.output_mode() == OutputMode::AggregateOnly {
                        self.check_cohort(plan, contract, rows.len())?;
                    }
                    exec.scan(&location, &rows)?;
                    rows = aggregate(&rows, *function, field.as_deref(), group_by, output)?;
                    aggregated = true;
                }
                Instruction::ClusterRef {
                    field,
                    into,
                    clusters,
                } => {
                    for (i, row) in rows.iter_mut().enumerate() {
                        exec.tick(&location, i)?;
                        if let Some(value) = row.get(field) {
                            let cluster = cluster_of(field, value, *clusters)?;
                            row.insert(into.clone(), cluster);
                        }
                    }
                }
                Instruction::Redact { fields } => {
                    for row in &mut rows {
                        for field in fields {
                            row.remove(field);
                        }
                    }
                }
                Instruction::Sample { rate, seed } => {
                    exec.scan(&location, &rows)?;
                    let plan_id = plan.plan_id().to_string();
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if sampled(&row, &plan_id, *seed, *rate)? {
                            kept.push(row);
                        }
                    }
                    rows = kept;
                }
                Instruction::Export | Instruction::PackCapsule { .. } => {}
            }
            exec.memory = rows.iter().map(row_size).sum();
        }
        exec.governor.checkpoint("end of plan", exec.memory)?;

        if rows.len() as u64 > plan.max_output_records() {
            return Err(NodeError::resource_exceeded(
                "output",
                format!(
                    "{} rows exceed the cap of {}",
                    rows.len(),
                    plan.max_output_records()
                ),
            ));
        }
        Ok(rows)
    }

    fn check_cohort(
        &self,
        plan: &ValidatedPlan,
        contract: &ActiveContract,
        cohort: usize,
    ) -> Result<()> {
        let floor = contract.terms().k_min.max(self.privacy.k_min);
        if (cohort as u64) < floor {
            self.audit.append(
                AuditRecord::new(AuditEventType::BelowKMin)
                    .with("plan_id", plan.plan_id())
                    .with("cohort", cohort)
                    .with("floor", floor),
            )?;
            return Err(NodeError::access_denied(format!(
                "cohort of {cohort} is below k_min {floor}"
            )));
        }
        Ok(())
    }

    fn finish(&self, plan: &ValidatedPlan, rows: Vec<Row>, usage: ResourceUsage) -> Result<VmOutput> {
        let schema: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
        let output = VmOutput {
            plan_id: plan.plan_id(),
            contract_id: plan.contract_id(),
            schema: schema.into_iter().cloned().collect(),
            rows,
            exportable: plan.exports(),
            usage,
        };
        let bytes = output.canonical_bytes()?;
        if bytes.len() as u64 > self.config.max_output_bytes {
            let e = NodeError::resource_exceeded(
                "output",
                format!(
                    "{} bytes exceed the cap of {}",
                    bytes.len(),
                    self.config.max_output_bytes
                ),
            );
            self.audit.append(
                AuditRecord::new(AuditEventType::ResourceExceeded)
                    .with("plan_id", plan.plan_id())
                    .with("reason", &e),
            )?;
            return Err(e);
        }
        self.audit.append(
            AuditRecord::new(AuditEventType::PlanExecuted)
                .with("plan_id", plan.plan_id())
                .with("contract_id", plan.contract_id())
                .with("rows", output.rows.len())
                .with("output_hash", sha256(&bytes).to_hex()),
        )?;
        info!(
            plan_id = %plan.plan_id(),
            rows = output.rows.len(),
            wall_clock_ms = usage.wall_clock_ms,
            "plan executed"
        );
        Ok(output)
    }
}

impl std::fmt::Debug for QueryPlanVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPlanVm")
            .field("config", &self.config)
            .field("privacy", &self.privacy)
            .finish_non_exhaustive()
    }
}

/// Per-run checkpoint bookkeeping
struct Execution<'a> {
    governor: &'a mut ResourceGovernor,
    interval: usize,
    memory: u64,
}

impl Execution<'_> {
    fn tick(&mut self, location: &str, row: usize) -> Result<()> {
        if row > 0 && row % self.interval == 0 {
            self.governor.checkpoint(location, self.memory)?;
        }
        Ok(())
    }

    fn scan(&mut self, location: &str, rows: &[Row]) -> Result<()> {
        for i in 0..rows.len() {
            self.tick(location, i)?;
        }
        Ok(())
    }
}

fn row_size(row: &Row) -> u64 {
    row.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.len(),
                Value::Array(a) => a.len() * 8,
                Value::Object(o) => o.len() * 16,
                _ => 8,
            };
            (key.len() + value + 16) as u64
        })
        .sum()
}

fn bucket_of(field: &str, value: &Value, spec: &BucketSpec) -> Result<Value> {
    match spec {
        BucketSpec::Time(granularity) => {
            let ts = value.as_u64().ok_or_else(|| {
                NodeError::validation(format!("BUCKETIZE expects a timestamp in {field}"))
            })?;
            Ok(Value::from(granularity.bucket(ts)?))
        }
        BucketSpec::Width(width) => {
            let v = value.as_f64().ok_or_else(|| {
                NodeError::validation(format!("BUCKETIZE expects a number in {field}"))
            })?;
            number((v / width).floor() * width)
        }
    }
}

fn cluster_of(field: &str, value: &Value, clusters: u32) -> Result<Value> {
    let canonical = to_canonical_bytes(value)?;
    let digest = sha256_parts(&[field.as_bytes(), &canonical]);
    let mut head = [0u8; 4];
    head.copy_from_slice(&digest.as_bytes()[..4]);
    Ok(Value::from(format!("c{}", u32::from_be_bytes(head) % clusters)))
}

fn sampled(row: &Row, plan_id: &str, seed: u64, rate: f64) -> Result<bool> {
    let canonical = to_canonical_bytes(row)?;
    let digest = sha256_parts(&[&seed.to_be_bytes(), plan_id.as_bytes(), &canonical]);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    Ok((u64::from_be_bytes(head) as f64 / u64::MAX as f64) < rate)
}

#[derive(Default)]
struct Accumulator {
    key: Vec<Value>,
    count: u64,
    values: Vec<f64>,
}

fn aggregate(
    rows: &[Row],
    function: AggFn,
    field: Option<&str>,
    group_by: &[String],
    output: &str,
) -> Result<Vec<Row>> {
    let mut groups: BTreeMap<Vec<u8>, Accumulator> = BTreeMap::new();
    for row in rows {
        let key: Vec<Value> = group_by
            .iter()
            .map(|g| row.get(g).cloned().unwrap_or(Value::Null))
            .collect();
        let entry = groups.entry(to_canonical_bytes(&key)?).or_default();
        if entry.count == 0 {
            entry.key = key;
        }
        entry.count += 1;
        if let Some(field) = field {
            match row.get(field) {
                None | Some(Value::Null) => {}
                Some(value) => entry.values.push(value.as_f64().ok_or_else(|| {
                    NodeError::validation(format!("AGGREGATE expects a number in {field}"))
                })?),
            }
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for accumulator in groups.into_values() {
        let mut row: Row = group_by.iter().cloned().zip(accumulator.key).collect();
        let values = &accumulator.values;
        let result = match function {
            AggFn::Count => Value::from(accumulator.count),
            AggFn::Sum => number(values.iter().sum())?,
            AggFn::Avg if values.is_empty() => Value::Null,
            AggFn::Avg => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                number((mean * AVG_PRECISION).round() / AVG_PRECISION)?
            }
            AggFn::Min => match values.iter().copied().reduce(f64::min) {
                Some(v) => number(v)?,
                None => Value::Null,
            },
            AggFn::Max => match values.iter().copied().reduce(f64::max) {
                Some(v) => number(v)?,
                None => Value::Null,
            },
        };
        row.insert(output.to_string(), result);
        out.push(row);
    }
    Ok(out)
}
