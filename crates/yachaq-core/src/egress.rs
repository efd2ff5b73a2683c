//! Execution lockdown for network egress
//!
//! While any [`EgressGuard`] is alive, the network gate refuses every outbound
//! request. Plan execution holds a guard for its whole run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared lockdown counter
#[derive(Debug, Clone, Default)]
pub struct EgressLock {
    holders: Arc<AtomicUsize>,
}

impl EgressLock {
    /// Unlocked
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock egress until the guard drops
    pub fn lock(&self) -> EgressGuard {
        self.holders.fetch_add(1, Ordering::SeqCst);
        EgressGuard {
            holders: self.holders.clone(),
        }
    }

    /// Whether any guard is alive
    pub fn is_locked(&self) -> bool {
        self.holders.load(Ordering::SeqCst) > 0
    }
}

/// RAII lockdown; releases on drop, including on error paths
#[derive(Debug)]
pub struct EgressGuard {
    holders: Arc<AtomicUsize>,
}

impl Drop for EgressGuard {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}
