//! Active contract store

use crate::contract::ActiveContract;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use yachaq_core::{
    AuditEventType, AuditRecord, AuditSink, ContractId, Effects, NodeError, Result,
};

/// Lifecycle state at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    /// Within validity and not revoked
    Active,
    /// Not yet started
    Pending,
    /// Past expiry
    Expired,
    /// Revoked by the user
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredContract {
    contract: ActiveContract,
    revoked_at_ms: Option<u64>,
}

/// Keeps dual-signed contracts. Contracts are never modified; revocation is a
/// separate marker.
pub struct ContractStore {
    contracts: RwLock<BTreeMap<ContractId, StoredContract>>,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl ContractStore {
    /// Empty store
    pub fn new(audit: Arc<dyn AuditSink>, effects: Effects) -> Self {
        Self {
            contracts: RwLock::new(BTreeMap::new()),
            audit,
            effects,
        }
    }

    /// Store a freshly activated contract
    pub fn insert(&self, contract: ActiveContract) -> Result<()> {
        let id = contract.id();
        let terms = contract.terms();
        let record = AuditRecord::new(AuditEventType::ConsentSigned)
            .with("contract_id", id)
            .with("request_id", terms.request_id)
            .with("contract_hash", contract.contract_hash().to_hex());
        {
            let mut contracts = self.contracts.write();
            if contracts.contains_key(&id) {
                return Err(NodeError::validation(format!("contract {id} already stored")));
            }
            contracts.insert(
                id,
                StoredContract {
                    contract,
                    revoked_at_ms: None,
                },
            );
        }
        info!(contract_id = %id, "contract active");
        self.audit.append(record)
    }

    /// Look up a contract
    pub fn get(&self, id: &ContractId) -> Option<ActiveContract> {
        self.contracts.read().get(id).map(|s| s.contract.clone())
    }

    /// Revoke a contract; later executions are refused
    pub fn revoke(&self, id: &ContractId, reason: &str) -> Result<()> {
        let now = self.effects.now_ms();
        {
            let mut contracts = self.contracts.write();
            let stored = contracts
                .get_mut(id)
                .ok_or_else(|| NodeError::not_found(format!("contract {id}")))?;
            if stored.revoked_at_ms.is_some() {
                return Ok(());
            }
            stored.revoked_at_ms = Some(now);
        }
        warn!(contract_id = %id, reason, "contract revoked");
        self.audit.append(
            AuditRecord::new(AuditEventType::ContractRevoked)
                .with("contract_id", id)
                .with("reason", reason),
        )
    }

    /// Status at `now_ms`
    pub fn status(&self, id: &ContractId, now_ms: u64) -> Option<ContractStatus> {
        self.contracts.read().get(id).map(|stored| {
            let terms = stored.contract.terms();
            if stored.revoked_at_ms.is_some() {
                ContractStatus::Revoked
            } else if now_ms < terms.starts_at_ms {
                ContractStatus::Pending
            } else if now_ms >= terms.expires_at_ms {
                ContractStatus::Expired
            } else {
                ContractStatus::Active
            }
        })
    }

    /// The contract if it is usable now
    pub fn require_active(&self, id: &ContractId) -> Result<ActiveContract> {
        let now = self.effects.now_ms();
        match self.status(id, now) {
            None => Err(NodeError::not_found(format!("contract {id}"))),
            Some(ContractStatus::Active) => self
                .get(id)
                .ok_or_else(|| NodeError::not_found(format!("contract {id}"))),
            Some(ContractStatus::Expired) => {
                Err(NodeError::ttl_expired(format!("contract {id} expired")))
            }
            Some(status) => Err(NodeError::access_denied(format!(
                "contract {id} is {status:?}"
            ))),
        }
    }

    /// Number of stored contracts
    pub fn len(&self) -> usize {
        self.contracts.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.contracts.read().is_empty()
    }

    /// Write all contracts as JSON
    pub fn persist(&self, path: &Path) -> Result<()> {
        let contracts: Vec<StoredContract> = self.contracts.read().values().cloned().collect();
        let json = serde_json::to_vec_pretty(&contracts)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load contracts; each one's signatures are re-verified
    pub fn restore(path: &Path, audit: Arc<dyn AuditSink>, effects: Effects) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let contracts: Vec<StoredContract> = serde_json::from_slice(&bytes)
            .map_err(|e| NodeError::integrity(format!("contract store unreadable: {e}")))?;
        let store = Self::new(audit, effects);
        {
            let mut map = store.contracts.write();
            for stored in contracts {
                map.insert(stored.contract.id(), stored);
            }
        }
        Ok(store)
    }
}

impl std::fmt::Debug for ContractStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractStore")
            .field("contracts", &self.len())
            .finish_non_exhaustive()
    }
}
