//! Closed instruction set
//!
//! The VM executes only [`Instruction`] values. Wire steps are decoded here, and
//! anything that does not decode (unknown opcode, unknown or ill-typed parameter)
//! is a validation error.

use crate::plan::PlanStep;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use yachaq_core::{NodeError, Result, TimeGranularity, TimeWindow};

/// The opcode allowlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    /// Choose the input rows
    Select,
    /// Keep rows matching a comparison
    Filter,
    /// Keep only named fields
    Project,
    /// Map a value onto a bucket
    Bucketize,
    /// Group and reduce
    Aggregate,
    /// Replace a value by a cluster reference
    ClusterRef,
    /// Drop fields
    Redact,
    /// Deterministic subset
    Sample,
    /// Mark the output exportable
    Export,
    /// Hand the output to the capsule packager
    PackCapsule,
}

impl Opcode {
    /// Every opcode
    pub const ALL: [Opcode; 10] = [
        Self::Select,
        Self::Filter,
        Self::Project,
        Self::Bucketize,
        Self::Aggregate,
        Self::ClusterRef,
        Self::Redact,
        Self::Sample,
        Self::Export,
        Self::PackCapsule,
    ];

    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Filter => "FILTER",
            Self::Project => "PROJECT",
            Self::Bucketize => "BUCKETIZE",
            Self::Aggregate => "AGGREGATE",
            Self::ClusterRef => "CLUSTER_REF",
            Self::Redact => "REDACT",
            Self::Sample => "SAMPLE",
            Self::Export => "EXPORT",
            Self::PackCapsule => "PACK_CAPSULE",
        }
    }

    /// Look up a wire name, ignoring ASCII case
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }

    /// Plain-language description for previews
    pub fn describe(self) -> &'static str {
        match self {
            Self::Select => "Select records",
            Self::Filter => "Filter records by a condition",
            Self::Project => "Keep only the listed fields",
            Self::Bucketize => "Group values into ranges",
            Self::Aggregate => "Summarise values (count, sum, average, min, max)",
            Self::ClusterRef => "Replace values with cluster references",
            Self::Redact => "Remove fields",
            Self::Sample => "Take a reproducible sample",
            Self::Export => "Allow results to be exported",
            Self::PackCapsule => "Package results into a time capsule",
        }
    }

    /// Contribution to the privacy impact score
    pub fn privacy_impact(self) -> i32 {
        match self {
            Self::Select | Self::Filter => 1,
            Self::Project => 2,
            Self::Bucketize | Self::Aggregate | Self::ClusterRef => 1,
            Self::Redact => -1,
            Self::Sample => 0,
            Self::Export => 5,
            Self::PackCapsule => 2,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison used by FILTER
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl FilterOp {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            _ => return None,
        })
    }

    /// Evaluate against a row value; missing or mismatched types never match
    pub fn matches(self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => match self {
                    Self::Eq => a == b,
                    Self::Ne => a != b,
                    Self::Gt => a > b,
                    Self::Ge => a >= b,
                    Self::Lt => a < b,
                    Self::Le => a <= b,
                },
                _ => false,
            },
            (Value::String(a), Value::String(b)) => match self {
                Self::Eq => a == b,
                Self::Ne => a != b,
                _ => false,
            },
            (Value::Bool(a), Value::Bool(b)) => match self {
                Self::Eq => a == b,
                Self::Ne => a != b,
                _ => false,
            },
            _ => false,
        }
    }
}

/// How BUCKETIZE maps values
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketSpec {
    /// Calendar bucket of a millisecond timestamp
    Time(TimeGranularity),
    /// Fixed-width numeric range, labelled by its lower bound
    Width(f64),
}

/// Reduction used by AGGREGATE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    /// Row count
    Count,
    /// Sum of a numeric field
    Sum,
    /// Mean of a numeric field
    Avg,
    /// Minimum of a numeric field
    Min,
    /// Maximum of a numeric field
    Max,
}

impl AggFn {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }
}

/// A decoded, typed step
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// SELECT
    Select {
        /// Record types to read
        record_types: BTreeSet<String>,
        /// Optional narrower time window
        window: Option<TimeWindow>,
    },
    /// FILTER
    Filter {
        /// Field compared
        field: String,
        /// Comparison
        op: FilterOp,
        /// Literal right-hand side
        value: Value,
    },
    /// PROJECT
    Project {
        /// Fields kept
        fields: Vec<String>,
    },
    /// BUCKETIZE
    Bucketize {
        /// Source field
        field: String,
        /// Output field
        into: String,
        /// Bucketing rule
        spec: BucketSpec,
    },
    /// AGGREGATE
    Aggregate {
        /// Reduction
        function: AggFn,
        /// Reduced field (not used by count)
        field: Option<String>,
        /// Grouping fields
        group_by: Vec<String>,
        /// Output field
        output: String,
    },
    /// CLUSTER_REF
    ClusterRef {
        /// Source field
        field: String,
        /// Output field
        into: String,
        /// Number of clusters
        clusters: u32,
    },
    /// REDACT
    Redact {
        /// Fields removed
        fields: Vec<String>,
    },
    /// SAMPLE
    Sample {
        /// Share of rows kept, in `(0, 1]`
        rate: f64,
        /// Sampling seed
        seed: u64,
    },
    /// EXPORT
    Export,
    /// PACK_CAPSULE
    PackCapsule {
        /// Capsule TTL override, never above the contract's
        ttl_secs: Option<u64>,
    },
}

impl Instruction {
    /// Decode a wire step
    pub fn decode(step: &PlanStep) -> Result<Self> {
        let opcode = Opcode::parse(&step.op).ok_or_else(|| {
            NodeError::validation(format!("opcode {} is not allowed", step.op))
        })?;
        let mut params = Params::new(opcode, &step.params);
        let instruction = match opcode {
            Opcode::Select => {
                let record_types: BTreeSet<String> =
                    params.str_list("record_types")?.into_iter().collect();
                if record_types.is_empty() {
                    return Err(params.error("record_types must not be empty"));
                }
                let window = match (params.opt_u64("start_ms")?, params.opt_u64("end_ms")?) {
                    (Some(start), Some(end)) => Some(TimeWindow::new(start, end)?),
                    (None, None) => None,
                    _ => return Err(params.error("start_ms and end_ms go together")),
                };
                Self::Select {
                    record_types,
                    window,
                }
            }
            Opcode::Filter => {
                let field = params.string("field")?;
                let op = params.string("op")?;
                let op = FilterOp::parse(&op)
                    .ok_or_else(|| params.error(&format!("unknown comparison {op}")))?;
                let value = params.value("value")?;
                if !matches!(value, Value::Number(_) | Value::String(_) | Value::Bool(_)) {
                    return Err(params.error("value must be a number, string or bool"));
                }
                Self::Filter { field, op, value }
            }
            Opcode::Project => {
                let fields = params.str_list("fields")?;
                if fields.is_empty() {
                    return Err(params.error("fields must not be empty"));
                }
                Self::Project { fields }
            }
            Opcode::Bucketize => {
                let field = params.string("field")?;
                let into = params.string("into")?;
                let granularity = params.opt_string("granularity")?;
                let width = params.opt_f64("width")?;
                let spec = match (granularity, width) {
                    (Some(g), None) => BucketSpec::Time(match g.as_str() {
                        "day" => TimeGranularity::Day,
                        "week" => TimeGranularity::Week,
                        "month" => TimeGranularity::Month,
                        "year" => TimeGranularity::Year,
                        other => {
                            return Err(params.error(&format!("unknown granularity {other}")))
                        }
                    }),
                    (None, Some(w)) if w > 0.0 && w.is_finite() => BucketSpec::Width(w),
                    _ => {
                        return Err(params.error("exactly one of granularity or a positive width"))
                    }
                };
                Self::Bucketize { field, into, spec }
            }
            Opcode::Aggregate => {
                let name = params.string("function")?;
                let function = AggFn::parse(&name)
                    .ok_or_else(|| params.error(&format!("unknown function {name}")))?;
                let field = params.opt_string("field")?;
                if function != AggFn::Count && field.is_none() {
                    return Err(params.error("field is required"));
                }
                let group_by = params.opt_str_list("group_by")?.unwrap_or_default();
                let output = params.string("output")?;
                Self::Aggregate {
                    function,
                    field,
                    group_by,
                    output,
                }
            }
            Opcode::ClusterRef => {
                let field = params.string("field")?;
                let into = params
                    .opt_string("into")?
                    .unwrap_or_else(|| format!("{field}_cluster"));
                let clusters = params.opt_u64("clusters")?.unwrap_or(16);
                if !(1..=256).contains(&clusters) {
                    return Err(params.error("clusters must be within 1..=256"));
                }
                Self::ClusterRef {
                    field,
                    into,
                    clusters: clusters as u32,
                }
            }
            Opcode::Redact => {
                let fields = params.str_list("fields")?;
                if fields.is_empty() {
                    return Err(params.error("fields must not be empty"));
                }
                Self::Redact { fields }
            }
            Opcode::Sample => {
                let rate = params.f64("rate")?;
                if !(rate > 0.0 && rate <= 1.0) {
                    return Err(params.error("rate must be within (0, 1]"));
                }
                let seed = params.opt_u64("seed")?.unwrap_or(0);
                Self::Sample { rate, seed }
            }
            Opcode::Export => {
                let format = params.opt_string("format")?;
                if format.as_deref().is_some_and(|f| f != "json") {
                    return Err(params.error("only json export is supported"));
                }
                Self::Export
            }
            Opcode::PackCapsule => Self::PackCapsule {
                ttl_secs: params.opt_u64("ttl_secs")?,
            },
        };
        params.finish()?;
        Ok(instruction)
    }

    /// Opcode of this instruction
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Select { .. } => Opcode::Select,
            Self::Filter { .. } => Opcode::Filter,
            Self::Project { .. } => Opcode::Project,
            Self::Bucketize { .. } => Opcode::Bucketize,
            Self::Aggregate { .. } => Opcode::Aggregate,
            Self::ClusterRef { .. } => Opcode::ClusterRef,
            Self::Redact { .. } => Opcode::Redact,
            Self::Sample { .. } => Opcode::Sample,
            Self::Export => Opcode::Export,
            Self::PackCapsule { .. } => Opcode::PackCapsule,
        }
    }

    /// Row fields the instruction reads
    pub fn input_fields(&self) -> Vec<&str> {
        match self {
            Self::Filter { field, .. }
            | Self::Bucketize { field, .. }
            | Self::ClusterRef { field, .. } => vec![field.as_str()],
            Self::Project { fields } => fields.iter().map(String::as_str).collect(),
            Self::Aggregate {
                field, group_by, ..
            } => group_by
                .iter()
                .map(String::as_str)
                .chain(field.as_deref())
                .collect(),
            Self::Select { .. }
            | Self::Redact { .. }
            | Self::Sample { .. }
            | Self::Export
            | Self::PackCapsule { .. } => Vec::new(),
        }
    }

    /// Fields the instruction creates
    pub fn output_fields(&self) -> Vec<&str> {
        match self {
            Self::Bucketize { into, .. } | Self::ClusterRef { into, .. } => vec![into.as_str()],
            Self::Aggregate { output, .. } => vec![output.as_str()],
            _ => Vec::new(),
        }
    }

    /// One-line description for previews
    pub fn describe(&self) -> String {
        let detail = match self {
            Self::Select {
                record_types,
                window,
            } => {
                let types: Vec<&str> = record_types.iter().map(String::as_str).collect();
                match window {
                    Some(w) => format!("{} in {w}", types.join(", ")),
                    None => types.join(", "),
                }
            }
            Self::Filter { field, op, value } => format!("{field} {op:?} {value}"),
            Self::Project { fields } | Self::Redact { fields } => fields.join(", "),
            Self::Bucketize { field, into, spec } => match spec {
                BucketSpec::Time(g) => format!("{field} by {g:?} into {into}"),
                BucketSpec::Width(w) => format!("{field} in steps of {w} into {into}"),
            },
            Self::Aggregate {
                function,
                field,
                group_by,
                output,
            } => {
                let of = field.as_deref().unwrap_or("rows");
                if group_by.is_empty() {
                    format!("{function:?} of {of} as {output}")
                } else {
                    format!("{function:?} of {of} per {} as {output}", group_by.join(", "))
                }
            }
            Self::ClusterRef {
                field, clusters, ..
            } => format!("{field} into {clusters} clusters"),
            Self::Sample { rate, .. } => format!("{:.0}% of rows", rate * 100.0),
            Self::Export => "json".to_string(),
            Self::PackCapsule { ttl_secs } => match ttl_secs {
                Some(ttl) => format!("expires after {ttl}s"),
                None => "contract TTL".to_string(),
            },
        };
        format!("{}: {detail}", self.opcode().describe())
    }
}

/// Parameter reader that rejects anything it was not asked for
struct Params<'a> {
    opcode: Opcode,
    map: &'a Map<String, Value>,
    used: BTreeSet<&'static str>,
}

impl<'a> Params<'a> {
    fn new(opcode: Opcode, map: &'a Map<String, Value>) -> Self {
        Self {
            opcode,
            map,
            used: BTreeSet::new(),
        }
    }

    fn error(&self, message: &str) -> NodeError {
        NodeError::validation(format!("{}: {message}", self.opcode))
    }

    fn get(&mut self, key: &'static str) -> Option<&'a Value> {
        self.used.insert(key);
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn value(&mut self, key: &'static str) -> Result<Value> {
        self.get(key)
            .cloned()
            .ok_or_else(|| self.error(&format!("missing {key}")))
    }

    fn opt_string(&mut self, key: &'static str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
            Some(_) => Err(self.error(&format!("{key} must be a non-empty string"))),
        }
    }

    fn string(&mut self, key: &'static str) -> Result<String> {
        self.opt_string(key)?
            .ok_or_else(|| self.error(&format!("missing {key}")))
    }

    fn opt_u64(&mut self, key: &'static str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.error(&format!("{key} must be a non-negative integer"))),
        }
    }

    fn opt_f64(&mut self, key: &'static str) -> Result<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.error(&format!("{key} must be a number"))),
        }
    }

    fn f64(&mut self, key: &'static str) -> Result<f64> {
        self.opt_f64(key)?
            .ok_or_else(|| self.error(&format!("missing {key}")))
    }

    fn opt_str_list(&mut self, key: &'static str) -> Result<Option<Vec<String>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) if !s.is_empty() => Ok(s.clone()),
                    _ => Err(self.error(&format!("{key} must list non-empty strings"))),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(self.error(&format!("{key} must be an array"))),
        }
    }

    fn str_list(&mut self, key: &'static str) -> Result<Vec<String>> {
        self.opt_str_list(key)?
            .ok_or_else(|| self.error(&format!("missing {key}")))
    }

    fn finish(self) -> Result<()> {
        match self.map.keys().find(|k| !self.used.contains(k.as_str())) {
            Some(unknown) => Err(self.error(&format!("unknown parameter {unknown}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_decode_allowlisted() {
        let step = PlanStep::new(
            "BUCKETIZE",
            json!({"field": "event.t_start", "granularity": "week", "into": "week"}),
        );
        assert_eq!(
            Instruction::decode(&step).unwrap(),
            Instruction::Bucketize {
                field: "event.t_start".into(),
                into: "week".into(),
                spec: BucketSpec::Time(TimeGranularity::Week),
            }
        );
        let lower = PlanStep::new("select", json!({"record_types": ["trip"]}));
        assert_eq!(Instruction::decode(&lower).unwrap().opcode(), Opcode::Select);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        for op in ["EXEC_ARBITRARY", "eval", "SHELL", "", "SELECT;DROP"] {
            let step = PlanStep::new(op, json!({}));
            assert_matches!(Instruction::decode(&step), Err(NodeError::Validation { .. }));
        }
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let step = PlanStep::new(
            "REDACT",
            json!({"fields": ["attr.mode"], "script": "rm -rf /"}),
        );
        assert_matches!(Instruction::decode(&step), Err(NodeError::Validation { .. }));
    }

    #[test]
    fn test_parameter_types() {
        let bad = [
            PlanStep::new("SELECT", json!({"record_types": []})),
            PlanStep::new("SELECT", json!({"record_types": ["trip"], "start_ms": 5})),
            PlanStep::new("FILTER", json!({"field": "attr.x", "op": "~", "value": 1})),
            PlanStep::new("FILTER", json!({"field": "attr.x", "op": "==", "value": [1]})),
            PlanStep::new("BUCKETIZE", json!({"field": "a", "into": "b", "width": 0})),
            PlanStep::new("AGGREGATE", json!({"function": "avg", "output": "x"})),
            PlanStep::new("AGGREGATE", json!({"function": "median", "field": "a", "output": "x"})),
            PlanStep::new("SAMPLE", json!({"rate": 1.5})),
            PlanStep::new("CLUSTER_REF", json!({"field": "a", "clusters": 0})),
            PlanStep::new("EXPORT", json!({"format": "csv"})),
        ];
        for step in bad {
            assert!(Instruction::decode(&step).is_err(), "{step:?}");
        }
    }

    #[test]
    fn test_field_accounting() {
        let step = PlanStep::new(
            "AGGREGATE",
            json!({"function": "sum", "field": "attr.distance_m", "group_by": ["week"], "output": "km"}),
        );
        let instruction = Instruction::decode(&step).unwrap();
        assert_eq!(instruction.input_fields(), vec!["week", "attr.distance_m"]);
        assert_eq!(instruction.output_fields(), vec!["km"]);
    }

    #[test]
    fn test_privacy_impact_table() {
        let total: i32 = Opcode::ALL.iter().map(|op| op.privacy_impact()).sum();
        assert_eq!(total, 13);
        assert!(Opcode::Export.privacy_impact() > Opcode::Aggregate.privacy_impact());
    }
}
