//! Node configuration
//!
//! Privacy floors and resource ceilings are policy defaults, not algorithmic
//! constants, so every one of them lives here and is loaded from TOML.

use crate::device::NetworkType;
use crate::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Validation hook shared by every configuration section
pub trait ConfigValidation {
    /// Validate this configuration
    fn validate(&self) -> Result<()>;
}

/// Top-level node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Privacy floors
    pub privacy: PrivacyConfig,
    /// Query plan VM limits
    pub vm: VmConfig,
    /// Request inbox
    pub inbox: InboxConfig,
    /// Local matcher
    pub matching: MatchingConfig,
    /// Time capsules
    pub capsule: CapsuleConfig,
    /// P2P transport
    pub transport: TransportConfig,
    /// Connector sync retry behaviour
    pub connectors: BackoffConfig,
    /// Device-state job constraints
    pub scheduler: SchedulerConfig,
}

impl NodeConfig {
    /// Parse from a TOML string and validate
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| NodeError::validation(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| NodeError::serialization(format!("config encode failed: {e}")))
    }
}

impl ConfigValidation for NodeConfig {
    fn validate(&self) -> Result<()> {
        self.privacy.validate()?;
        self.vm.validate()?;
        self.inbox.validate()?;
        self.matching.validate()?;
        self.capsule.validate()?;
        self.transport.validate()?;
        self.connectors.validate()?;
        Ok(())
    }
}

/// Privacy floors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Minimum cohort size before an aggregate may be exposed
    pub k_min: u64,
    /// Floor applied to high-sensitivity facets (health)
    pub high_sensitivity_k_min: u64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            k_min: 50,
            high_sensitivity_k_min: 100,
        }
    }
}

impl ConfigValidation for PrivacyConfig {
    fn validate(&self) -> Result<()> {
        if self.k_min < 2 {
            return Err(NodeError::validation("privacy.k_min must be at least 2"));
        }
        if self.high_sensitivity_k_min < self.k_min {
            return Err(NodeError::validation(
                "privacy.high_sensitivity_k_min must not be below k_min",
            ));
        }
        Ok(())
    }
}

/// Resource ceilings for one plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time in milliseconds
    pub cpu_ms: u64,
    /// Approximate working-set bytes
    pub memory_bytes: u64,
    /// Wall-clock milliseconds
    pub wall_clock_ms: u64,
    /// Battery percentage points the run may consume
    pub battery_percent: u8,
}

impl ResourceLimits {
    /// Tight limits for untrusted or large plans
    pub fn strict() -> Self {
        Self {
            cpu_ms: 1_000,
            memory_bytes: 10 * 1024 * 1024,
            wall_clock_ms: 10_000,
            battery_percent: 2,
        }
    }

    /// Whether every field is within `ceiling`
    pub fn within(&self, ceiling: &ResourceLimits) -> bool {
        self.cpu_ms <= ceiling.cpu_ms
            && self.memory_bytes <= ceiling.memory_bytes
            && self.wall_clock_ms <= ceiling.wall_clock_ms
            && self.battery_percent <= ceiling.battery_percent
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_ms: 5_000,
            memory_bytes: 50 * 1024 * 1024,
            wall_clock_ms: 30_000,
            battery_percent: 5,
        }
    }
}

/// Query plan VM configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum output rows
    pub max_output_records: u64,
    /// Maximum output bytes
    pub max_output_bytes: u64,
    /// Rows processed between governor checkpoints
    pub checkpoint_interval_rows: usize,
    /// Plan versions this VM understands
    pub supported_plan_versions: Vec<u32>,
    /// Limits applied when a plan declares none
    pub default_limits: ResourceLimits,
    /// Hard ceilings no plan may exceed
    pub ceiling: ResourceLimits,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_output_records: 10_000,
            max_output_bytes: 10 * 1024 * 1024,
            checkpoint_interval_rows: 256,
            supported_plan_versions: vec![1],
            default_limits: ResourceLimits::default(),
            ceiling: ResourceLimits {
                cpu_ms: 60_000,
                memory_bytes: 100 * 1024 * 1024,
                wall_clock_ms: 120_000,
                battery_percent: 10,
            },
        }
    }
}

impl ConfigValidation for VmConfig {
    fn validate(&self) -> Result<()> {
        if !self.default_limits.within(&self.ceiling) {
            return Err(NodeError::validation(
                "vm.default_limits must be within vm.ceiling",
            ));
        }
        if self.checkpoint_interval_rows == 0 {
            return Err(NodeError::validation(
                "vm.checkpoint_interval_rows must be positive",
            ));
        }
        if self.supported_plan_versions.is_empty() {
            return Err(NodeError::validation(
                "vm.supported_plan_versions must not be empty",
            ));
        }
        Ok(())
    }
}

/// Request inbox configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Maximum pending requests
    pub capacity: usize,
    /// Longest TTL a request may declare, in seconds. Bounds nonce retention.
    pub max_request_ttl_secs: u64,
    /// Tolerated clock skew when checking freshness, in seconds
    pub clock_skew_secs: u64,
    /// Maximum predicate length in bytes
    pub max_predicate_len: usize,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_request_ttl_secs: 7 * 24 * 3_600,
            clock_skew_secs: 30,
            max_predicate_len: 1_024,
        }
    }
}

impl ConfigValidation for InboxConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(NodeError::validation("inbox.capacity must be positive"));
        }
        if self.max_request_ttl_secs == 0 {
            return Err(NodeError::validation(
                "inbox.max_request_ttl_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// How requests are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingMode {
    /// Every node evaluates every request
    #[default]
    Broadcast,
    /// Nodes only evaluate requests addressed to their rotating geo topic
    GeoTopic,
}

/// Local matcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Default discovery mode
    pub mode: MatchingMode,
    /// Allow switching to geo topics under load
    pub geo_topics_enabled: bool,
    /// Pending request count at which geo-topic matching kicks in
    pub geo_topic_capacity_threshold: usize,
    /// Topic rotation period in seconds
    pub topic_epoch_secs: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            mode: MatchingMode::Broadcast,
            geo_topics_enabled: false,
            geo_topic_capacity_threshold: 500,
            topic_epoch_secs: 86_400,
        }
    }
}

impl ConfigValidation for MatchingConfig {
    fn validate(&self) -> Result<()> {
        if self.topic_epoch_secs == 0 {
            return Err(NodeError::validation(
                "matching.topic_epoch_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Time capsule configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleConfig {
    /// Capsule TTL when the contract does not set one, in seconds
    pub default_ttl_secs: u64,
    /// Default contract duration, in seconds
    pub default_contract_secs: u64,
    /// Requester-side retention promise, in days
    pub retention_days: u32,
    /// How long the header of a shredded capsule is kept, in seconds
    pub tombstone_retention_secs: u64,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 24 * 3_600,
            default_contract_secs: 7 * 24 * 3_600,
            retention_days: 30,
            tombstone_retention_secs: 7 * 24 * 3_600,
        }
    }
}

impl ConfigValidation for CapsuleConfig {
    fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == 0 || self.default_contract_secs == 0 {
            return Err(NodeError::validation("capsule TTLs must be positive"));
        }
        Ok(())
    }
}

/// P2P transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Session lifetime in seconds
    pub session_ttl_secs: u64,
    /// Relay signaling record lifetime in seconds
    pub relay_record_ttl_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            session_ttl_secs: 3_600,
            relay_record_ttl_secs: 300,
        }
    }
}

impl ConfigValidation for TransportConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size < 1024 || self.chunk_size > 1024 * 1024 {
            return Err(NodeError::validation(
                "transport.chunk_size must be between 1 KiB and 1 MiB",
            ));
        }
        Ok(())
    }
}

/// Exponential backoff for connector sync and other transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Attempts before giving up (including the first)
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }
}

impl ConfigValidation for BackoffConfig {
    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(NodeError::validation(
                "connectors.multiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_attempts == 0 {
            return Err(NodeError::validation(
                "connectors.max_attempts must be positive",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(NodeError::validation(
                "connectors.base_delay_ms must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Device-state admission rules for one kind of job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConstraints {
    /// Minimum battery percentage unless charging
    pub min_battery_percent: u8,
    /// Only run while charging
    pub require_charging: bool,
    /// Highest tolerated thermal state (0 nominal .. 4 critical)
    pub max_thermal_state: u8,
    /// Network the job needs
    pub network: NetworkType,
}

/// Admission rules per job kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Background connector sync
    pub connector_sync: JobConstraints,
    /// Query plan execution
    pub plan_execution: JobConstraints,
    /// Capsule transfer
    pub transfer: JobConstraints,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            connector_sync: JobConstraints {
                min_battery_percent: 30,
                require_charging: false,
                max_thermal_state: 2,
                network: NetworkType::Unmetered,
            },
            plan_execution: JobConstraints {
                min_battery_percent: 20,
                require_charging: false,
                max_thermal_state: 3,
                network: NetworkType::None,
            },
            transfer: JobConstraints {
                min_battery_percent: 10,
                require_charging: false,
                max_thermal_state: 3,
                network: NetworkType::Any,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        NodeConfig::default().validate().unwrap();
        assert_eq!(NodeConfig::default().privacy.k_min, 50);
        assert_eq!(NodeConfig::default().matching.mode, MatchingMode::Broadcast);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = NodeConfig::from_toml_str(
            r#"
            [privacy]
            k_min = 75

            [vm.default_limits]
            cpu_ms = 2000
            memory_bytes = 1048576
            wall_clock_ms = 5000
            battery_percent = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.privacy.k_min, 75);
        assert_eq!(config.privacy.high_sensitivity_k_min, 100);
        assert_eq!(config.vm.default_limits.cpu_ms, 2000);
        assert_eq!(config.inbox.capacity, 1000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(NodeConfig::from_toml_str("[privacy]\nk_min = 1\n").is_err());
        assert!(NodeConfig::from_toml_str("[transport]\nchunk_size = 10\n").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NodeConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(NodeConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let backoff = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            max_attempts: 10,
        };
        assert_eq!(backoff.delay_ms(1), 100);
        assert_eq!(backoff.delay_ms(2), 200);
        assert_eq!(backoff.delay_ms(4), 800);
        assert_eq!(backoff.delay_ms(5), 1_000);
        assert_eq!(backoff.delay_ms(40), 1_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[capsule]\ndefault_ttl_secs = 60\n").unwrap();
        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.capsule.default_ttl_secs, 60);
    }
}
