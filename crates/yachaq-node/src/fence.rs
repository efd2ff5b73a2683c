//! Execution fence: one run per contract at a time, one execution per plan ever.
//!
//! A plan id is spent on entry, so a plan that fails still cannot be run again;
//! the requester has to sign a new plan.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::debug;
use yachaq_core::{ContractId, NodeError, PlanId, Result};

#[derive(Debug, Default)]
struct FenceState {
    running: BTreeSet<ContractId>,
    executed: BTreeSet<PlanId>,
}

/// Serializes plan execution per contract
#[derive(Debug, Default)]
pub struct ExecutionFence {
    state: Mutex<FenceState>,
}

impl ExecutionFence {
    /// Empty fence
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the contract for `plan_id`.
    ///
    /// A plan that already ran is a replay. A contract with a run in progress
    /// defers the caller.
    pub fn enter(&self, contract_id: ContractId, plan_id: PlanId) -> Result<FenceGuard<'_>> {
        let mut state = self.state.lock();
        if state.executed.contains(&plan_id) {
            return Err(NodeError::replay(format!("plan {plan_id} already executed")));
        }
        if state.running.contains(&contract_id) {
            return Err(NodeError::deferred(format!(
                "contract {contract_id} has a run in progress"
            )));
        }
        state.running.insert(contract_id);
        state.executed.insert(plan_id);
        debug!(contract_id = %contract_id, plan_id = %plan_id, "fence entered");
        Ok(FenceGuard {
            fence: self,
            contract_id,
        })
    }

    /// Whether a run holds the contract
    pub fn is_running(&self, contract_id: &ContractId) -> bool {
        self.state.lock().running.contains(contract_id)
    }

    /// Whether the plan id has been spent
    pub fn has_executed(&self, plan_id: &PlanId) -> bool {
        self.state.lock().executed.contains(plan_id)
    }
}

/// Releases the contract on drop
#[derive(Debug)]
pub struct FenceGuard<'a> {
    fence: &'a ExecutionFence,
    contract_id: ContractId,
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        self.fence.state.lock().running.remove(&self.contract_id);
    }
}
