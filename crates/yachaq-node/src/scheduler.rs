//! Device-state admission for background jobs

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use yachaq_core::config::{JobConstraints, SchedulerConfig};
use yachaq_core::{DeviceState, DeviceStateProvider, NodeError, Result};

/// Independently schedulable job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Pull from a connector into the vault
    ConnectorSync,
    /// Run a query plan
    PlanExecution,
    /// Send a capsule to a requester
    Transfer,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConnectorSync => "connector_sync",
            Self::PlanExecution => "plan_execution",
            Self::Transfer => "transfer",
        })
    }
}

/// Admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs allowed to start
    pub admitted: u64,
    /// Jobs deferred by device state
    pub deferred: u64,
}

/// Checks jobs against [`JobConstraints`] and the current device state
pub struct TaskScheduler {
    config: SchedulerConfig,
    device: Arc<dyn DeviceStateProvider>,
    admitted: AtomicU64,
    deferred: AtomicU64,
}

impl TaskScheduler {
    /// Scheduler reading `device` on every admission
    pub fn new(config: SchedulerConfig, device: Arc<dyn DeviceStateProvider>) -> Self {
        Self {
            config,
            device,
            admitted: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    /// Constraints for a job kind
    pub fn constraints(&self, kind: JobKind) -> &JobConstraints {
        match kind {
            JobKind::ConnectorSync => &self.config.connector_sync,
            JobKind::PlanExecution => &self.config.plan_execution,
            JobKind::Transfer => &self.config.transfer,
        }
    }

    /// Admit a job or defer it
    pub fn admit(&self, kind: JobKind) -> Result<DeviceState> {
        let state = self.device.current();
        match unmet(self.constraints(kind), &state) {
            None => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                debug!(job = %kind, battery = state.battery_percent, "job admitted");
                Ok(state)
            }
            Some(reason) => {
                self.deferred.fetch_add(1, Ordering::Relaxed);
                info!(job = %kind, reason = %reason, "job deferred");
                Err(NodeError::deferred(format!("{kind} deferred: {reason}")))
            }
        }
    }

    /// Counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn unmet(constraints: &JobConstraints, state: &DeviceState) -> Option<String> {
    if constraints.require_charging && !state.charging {
        return Some("not charging".into());
    }
    if !state.charging && state.battery_percent < constraints.min_battery_percent {
        return Some(format!(
            "battery {}% below {}%",
            state.battery_percent, constraints.min_battery_percent
        ));
    }
    if state.thermal_state > constraints.max_thermal_state {
        return Some(format!("thermal state {}", state.thermal_state));
    }
    if !constraints.network.satisfied_by(state.network) {
        return Some(format!("network {:?}", state.network));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use yachaq_core::{NetworkType, StaticDeviceState};

    fn scheduler(state: DeviceState) -> (TaskScheduler, Arc<StaticDeviceState>) {
        let device = Arc::new(StaticDeviceState::new(state));
        (
            TaskScheduler::new(SchedulerConfig::default(), device.clone()),
            device,
        )
    }

    #[test]
    fn test_healthy_device_admits_everything() {
        let (scheduler, _) = scheduler(DeviceState::default());
        for kind in [JobKind::ConnectorSync, JobKind::PlanExecution, JobKind::Transfer] {
            scheduler.admit(kind).unwrap();
        }
        assert_eq!(scheduler.stats().admitted, 3);
    }

    #[test]
    fn test_low_battery_defers_until_charging() {
        let (scheduler, device) = scheduler(DeviceState {
            battery_percent: 15,
            charging: false,
            thermal_state: 0,
            network: NetworkType::Unmetered,
        });
        assert_matches!(
            scheduler.admit(JobKind::PlanExecution),
            Err(NodeError::Deferred { .. })
        );
        scheduler.admit(JobKind::Transfer).unwrap();

        device.update(|s| s.charging = true);
        scheduler.admit(JobKind::PlanExecution).unwrap();
        assert_eq!(scheduler.stats().deferred, 1);
    }

    #[test]
    fn test_metered_network_defers_sync_only() {
        let (scheduler, _) = scheduler(DeviceState {
            network: NetworkType::Any,
            ..DeviceState::default()
        });
        assert_matches!(
            scheduler.admit(JobKind::ConnectorSync),
            Err(NodeError::Deferred { .. })
        );
        scheduler.admit(JobKind::Transfer).unwrap();
        scheduler.admit(JobKind::PlanExecution).unwrap();
    }

    #[test]
    fn test_hot_device_defers() {
        let (scheduler, _) = scheduler(DeviceState {
            thermal_state: 4,
            ..DeviceState::default()
        });
        let err = scheduler.admit(JobKind::Transfer).unwrap_err();
        assert!(err.is_retryable());
    }
}
