//! Device state supplied by the OS integration layer

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Network connectivity, also used as a job requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Offline (as a requirement: the job needs no network)
    None,
    /// Metered cellular (as a requirement: any connection will do)
    Any,
    /// Unmetered connection such as Wi-Fi
    Unmetered,
}

impl NetworkType {
    /// Whether the current connection satisfies this requirement
    pub fn satisfied_by(self, current: NetworkType) -> bool {
        match self {
            Self::None => true,
            Self::Any => current != Self::None,
            Self::Unmetered => current == Self::Unmetered,
        }
    }
}

/// Snapshot of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Battery level 0..=100
    pub battery_percent: u8,
    /// Whether the device is plugged in
    pub charging: bool,
    /// Thermal state 0 (nominal) ..= 4 (critical)
    pub thermal_state: u8,
    /// Current connectivity
    pub network: NetworkType,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            battery_percent: 100,
            charging: true,
            thermal_state: 0,
            network: NetworkType::Unmetered,
        }
    }
}

/// Source of device state; implemented by the OS integration collaborator
pub trait DeviceStateProvider: Send + Sync {
    /// Current device state
    fn current(&self) -> DeviceState;
}

/// Settable device state for tests and the CLI
#[derive(Debug, Default)]
pub struct StaticDeviceState {
    state: Mutex<DeviceState>,
}

impl StaticDeviceState {
    /// Start from a given state
    pub fn new(state: DeviceState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Replace the state
    pub fn set(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    /// Update in place
    pub fn update(&self, f: impl FnOnce(&mut DeviceState)) {
        f(&mut self.state.lock());
    }
}

impl DeviceStateProvider for StaticDeviceState {
    fn current(&self) -> DeviceState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_requirements() {
        assert!(NetworkType::None.satisfied_by(NetworkType::None));
        assert!(NetworkType::Any.satisfied_by(NetworkType::Any));
        assert!(!NetworkType::Any.satisfied_by(NetworkType::None));
        assert!(!NetworkType::Unmetered.satisfied_by(NetworkType::Any));
    }

    #[test]
    fn test_static_state_updates() {
        let device = StaticDeviceState::default();
        device.update(|s| s.battery_percent = 12);
        assert_eq!(device.current().battery_percent, 12);
    }
}
