//! Resource governor
//!
//! Checked at every step boundary and every row batch. Wall clock is read
//! through [`Effects`] so tests can drive it. Execution is synchronous, so CPU
//! time is the monotonic time spent inside the run.

use std::sync::Arc;
use std::time::Instant;
use yachaq_core::{
    CancellationToken, DeviceStateProvider, Effects, NodeError, ResourceLimits, Result,
};

/// Enforces one run's limits
pub struct ResourceGovernor {
    limits: ResourceLimits,
    effects: Effects,
    device: Arc<dyn DeviceStateProvider>,
    cancel: CancellationToken,
    started_ms: u64,
    started_cpu: Instant,
    start_battery: u8,
    peak_memory: u64,
}

/// Usage observed by the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    /// Elapsed wall clock
    pub wall_clock_ms: u64,
    /// Monotonic time spent executing
    pub cpu_ms: u64,
    /// Peak working-set estimate
    pub peak_memory_bytes: u64,
    /// Battery points consumed
    pub battery_drain: u8,
}

impl ResourceGovernor {
    /// Start governing now
    pub fn start(
        limits: ResourceLimits,
        effects: Effects,
        device: Arc<dyn DeviceStateProvider>,
        cancel: CancellationToken,
    ) -> Self {
        let start_battery = device.current().battery_percent;
        Self {
            limits,
            started_ms: effects.now_ms(),
            effects,
            device,
            cancel,
            started_cpu: Instant::now(),
            start_battery,
            peak_memory: 0,
        }
    }

    /// Checkpoint with the current working-set estimate
    pub fn checkpoint(&mut self, location: &str, memory_bytes: u64) -> Result<()> {
        self.cancel.checkpoint(location)?;
        self.peak_memory = self.peak_memory.max(memory_bytes);
        let usage = self.usage();

        if usage.wall_clock_ms > self.limits.wall_clock_ms {
            return Err(NodeError::resource_exceeded(
                "wall_clock",
                format!(
                    "{}ms elapsed, limit {}ms at {location}",
                    usage.wall_clock_ms, self.limits.wall_clock_ms
                ),
            ));
        }
        if usage.cpu_ms > self.limits.cpu_ms {
            return Err(NodeError::resource_exceeded(
                "cpu",
                format!("{}ms used, limit {}ms", usage.cpu_ms, self.limits.cpu_ms),
            ));
        }
        if memory_bytes > self.limits.memory_bytes {
            return Err(NodeError::resource_exceeded(
                "memory",
                format!(
                    "{memory_bytes} bytes held, limit {}",
                    self.limits.memory_bytes
                ),
            ));
        }
        if usage.battery_drain > self.limits.battery_percent {
            return Err(NodeError::resource_exceeded(
                "battery",
                format!(
                    "{}% drained, limit {}%",
                    usage.battery_drain, self.limits.battery_percent
                ),
            ));
        }
        Ok(())
    }

    /// Usage so far
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            wall_clock_ms: self.effects.now_ms().saturating_sub(self.started_ms),
            cpu_ms: self.started_cpu.elapsed().as_millis() as u64,
            peak_memory_bytes: self.peak_memory,
            battery_drain: self
                .start_battery
                .saturating_sub(self.device.current().battery_percent),
        }
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("limits", &self.limits)
            .field("started_ms", &self.started_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use yachaq_core::{DeviceState, ManualClock, StaticDeviceState};

    fn governor(
        device: Arc<StaticDeviceState>,
    ) -> (ResourceGovernor, Arc<ManualClock>, CancellationToken) {
        let (effects, clock) = Effects::deterministic(1, 1_000_000);
        let cancel = CancellationToken::new();
        let governor =
            ResourceGovernor::start(ResourceLimits::default(), effects, device, cancel.clone());
        (governor, clock, cancel)
    }

    fn device() -> Arc<StaticDeviceState> {
        Arc::new(StaticDeviceState::new(DeviceState {
            battery_percent: 80,
            ..DeviceState::default()
        }))
    }

    #[test]
    fn test_within_limits() {
        let (mut g, clock, _) = governor(device());
        clock.advance_ms(100);
        g.checkpoint("step 1", 1024).unwrap();
        assert_eq!(g.usage().wall_clock_ms, 100);
        assert_eq!(g.usage().peak_memory_bytes, 1024);
    }

    #[test]
    fn test_wall_clock_breach() {
        let (mut g, clock, _) = governor(device());
        clock.advance_secs(31);
        assert_matches!(
            g.checkpoint("step 2", 0),
            Err(NodeError::ResourceExceeded { resource, .. }) if resource == "wall_clock"
        );
    }

    #[test]
    fn test_memory_breach() {
        let (mut g, _, _) = governor(device());
        assert_matches!(
            g.checkpoint("rows", 51 * 1024 * 1024),
            Err(NodeError::ResourceExceeded { resource, .. }) if resource == "memory"
        );
    }

    #[test]
    fn test_battery_drain_breach() {
        let device = device();
        let (mut g, _, _) = governor(device.clone());
        device.update(|s| s.battery_percent = 74);
        assert_matches!(
            g.checkpoint("rows", 0),
            Err(NodeError::ResourceExceeded { resource, .. }) if resource == "battery"
        );
    }

    #[test]
    fn test_cancellation_wins() {
        let (mut g, clock, cancel) = governor(device());
        clock.advance_secs(60);
        cancel.cancel();
        assert_matches!(g.checkpoint("step 3", 0), Err(NodeError::Cancelled { .. }));
    }
}
