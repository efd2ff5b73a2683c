//! Runtime context
//!
//! Everything the node needs is created once by [`RuntimeBuilder::build`] and
//! owned by [`Runtime`]; there is no global state. The runtime is torn down
//! with [`Runtime::shutdown`].

use crate::connector::ConnectorSync;
use crate::fence::ExecutionFence;
use crate::scheduler::TaskScheduler;
use crate::tasks::TaskRegistry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use yachaq_audit::{AuditExport, AuditLog, AuditStore, ChainVerification};
use yachaq_capsule::{CapsulePackager, CapsuleStore};
use yachaq_consent::{ContractStore, LocalMatcher, RequestInbox, SingleSignedContract};
use yachaq_core::config::{ConfigValidation, NodeConfig};
use yachaq_core::{
    AuditEventType, AuditRecord, CapsuleId, ContractId, DeviceState, DeviceStateProvider, Effects,
    EgressLock, GeoCell, NodeError, RawRef, Result, StaticDeviceState,
};
use yachaq_crypto::{KeyRing, PublicKey, SecureKeyStore};
use yachaq_labels::IngestPipeline;
use yachaq_odx::OdxBuilder;
use yachaq_transport::{CapsuleSender, NetworkGate, OutgoingTransfer, PayloadClass};
use yachaq_vault::{LocalVault, RawItem};
use yachaq_vm::QueryPlanVm;

/// Where the node identity comes from
enum KeySource {
    Generate,
    Provided(KeyRing),
    Store {
        store: Arc<dyn SecureKeyStore>,
        device_secret: [u8; 32],
    },
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: NodeConfig,
    effects: Option<Effects>,
    device: Option<Arc<dyn DeviceStateProvider>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    keys: KeySource,
    trusted_authorities: Vec<PublicKey>,
    home: Option<GeoCell>,
    cursor_checkpoints: Option<PathBuf>,
}

impl RuntimeBuilder {
    /// Builder over `config` with production effects, an in-memory audit log
    /// and a fresh identity
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            effects: None,
            device: None,
            audit_store: None,
            keys: KeySource::Generate,
            trusted_authorities: Vec::new(),
            home: None,
            cursor_checkpoints: None,
        }
    }

    /// Use these effects (deterministic in tests)
    pub fn with_effects(mut self, effects: Effects) -> Self {
        self.effects = Some(effects);
        self
    }

    /// Read device state from `device`
    pub fn with_device(mut self, device: Arc<dyn DeviceStateProvider>) -> Self {
        self.device = Some(device);
        self
    }

    /// Persist the audit chain in `store`; an existing chain must verify
    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    /// Use an existing identity
    pub fn with_keyring(mut self, keyring: KeyRing) -> Self {
        self.keys = KeySource::Provided(keyring);
        self
    }

    /// Load the identity from platform storage, creating it on first boot
    pub fn with_key_store(
        mut self,
        store: Arc<dyn SecureKeyStore>,
        device_secret: [u8; 32],
    ) -> Self {
        self.keys = KeySource::Store {
            store,
            device_secret,
        };
        self
    }

    /// Accept policy stamps from `authority`
    pub fn trust_authority(mut self, authority: PublicKey) -> Self {
        self.trusted_authorities.push(authority);
        self
    }

    /// Coarse home cell for geo-topic matching
    pub fn with_home(mut self, home: GeoCell) -> Self {
        self.home = Some(home);
        self
    }

    /// Keep connector cursors in `path`
    pub fn with_cursor_checkpoints(mut self, path: impl Into<PathBuf>) -> Self {
        self.cursor_checkpoints = Some(path.into());
        self
    }

    /// Validate the config, wire every component and audit the start
    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let config = self.config;
        let effects = self.effects.unwrap_or_else(Effects::production);
        let device = self
            .device
            .unwrap_or_else(|| Arc::new(StaticDeviceState::new(DeviceState::default())));

        let audit = Arc::new(match self.audit_store {
            Some(store) => AuditLog::open(store, effects.clone())?,
            None => AuditLog::in_memory(effects.clone()),
        });
        let keyring = Arc::new(match self.keys {
            KeySource::Generate => KeyRing::generate(&effects),
            KeySource::Provided(keyring) => keyring,
            KeySource::Store {
                store,
                device_secret,
            } => KeyRing::load_or_create(store.as_ref(), &device_secret, &effects)?,
        });

        let egress = EgressLock::new();
        let vault = Arc::new(LocalVault::new(audit.clone(), effects.clone()));
        let odx = OdxBuilder::new(config.privacy.clone(), audit.clone());
        let inbox = RequestInbox::new(
            config.inbox.clone(),
            self.trusted_authorities,
            audit.clone(),
            effects.clone(),
        );
        let matcher = LocalMatcher::new(
            config.privacy.clone(),
            config.matching.clone(),
            self.home,
            audit.clone(),
            effects.clone(),
        );
        let contracts = ContractStore::new(audit.clone(), effects.clone());
        let vm = QueryPlanVm::new(
            config.vm.clone(),
            config.privacy.clone(),
            audit.clone(),
            effects.clone(),
            device.clone(),
            egress.clone(),
        );
        let capsules = Arc::new(CapsuleStore::new(audit.clone(), effects.clone()));
        let packager = CapsulePackager::new(
            keyring.clone(),
            capsules.clone(),
            audit.clone(),
            effects.clone(),
        );
        let gate = Arc::new(NetworkGate::new(egress, audit.clone(), effects.clone())?);
        let sender = CapsuleSender::new(audit.clone(), effects.clone());
        let scheduler = TaskScheduler::new(config.scheduler.clone(), device);
        let sync = match self.cursor_checkpoints {
            Some(path) => ConnectorSync::with_checkpoints(config.connectors.clone(), path)?,
            None => ConnectorSync::new(config.connectors.clone()),
        };

        let runtime = Runtime {
            config,
            effects,
            audit,
            keyring,
            vault,
            pipeline: IngestPipeline::with_defaults(),
            odx,
            inbox,
            matcher,
            contracts,
            vm,
            capsules,
            packager,
            gate,
            sender,
            scheduler,
            fence: ExecutionFence::new(),
            sync,
            awaiting_countersign: Mutex::new(BTreeMap::new()),
            transfers: Mutex::new(BTreeMap::new()),
            tasks: TaskRegistry::new(),
            stopped: AtomicBool::new(false),
        };
        runtime.audit.record(
            AuditRecord::new(AuditEventType::RuntimeStarted)
                .with("node_id", runtime.keyring.node_id())
                .with("k_min", runtime.config.privacy.k_min),
        )?;
        info!(
            node_id = %runtime.keyring.node_id(),
            audit_entries = runtime.audit.len(),
            "runtime started"
        );
        Ok(runtime)
    }
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .field("trusted_authorities", &self.trusted_authorities.len())
            .finish_non_exhaustive()
    }
}

/// Delivery state of one capsule
pub(crate) enum TransferSlot {
    /// Waiting for a (re)connection, keeping the acknowledged offset
    Pending(OutgoingTransfer),
    /// A delivery holds the transfer
    InFlight,
}

/// Result of storing one raw item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// Vault reference
    pub raw_ref: RawRef,
    /// Whether the item was normalized and indexed
    pub labeled: bool,
}

/// What a maintenance sweep cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Local capsule copies whose keys were destroyed
    pub capsules_shredded: usize,
    /// Vault objects past their TTL
    pub vault_purged: usize,
    /// Index events withdrawn with the purged objects
    pub events_retracted: usize,
    /// Expired inbox requests
    pub requests_dropped: usize,
    /// Pending transfers of shredded capsules
    pub transfers_dropped: usize,
    /// Shredded capsule headers past their retention
    pub tombstones_pruned: usize,
}

/// The node: one owner for every component, created at boot
pub struct Runtime {
    pub(crate) config: NodeConfig,
    pub(crate) effects: Effects,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) keyring: Arc<KeyRing>,
    pub(crate) vault: Arc<LocalVault>,
    pub(crate) pipeline: IngestPipeline,
    pub(crate) odx: OdxBuilder,
    pub(crate) inbox: RequestInbox,
    pub(crate) matcher: LocalMatcher,
    pub(crate) contracts: ContractStore,
    pub(crate) vm: QueryPlanVm,
    pub(crate) capsules: Arc<CapsuleStore>,
    pub(crate) packager: CapsulePackager,
    pub(crate) gate: Arc<NetworkGate>,
    pub(crate) sender: CapsuleSender,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) fence: ExecutionFence,
    pub(crate) sync: ConnectorSync,
    pub(crate) awaiting_countersign: Mutex<BTreeMap<ContractId, SingleSignedContract>>,
    pub(crate) transfers: Mutex<BTreeMap<CapsuleId, TransferSlot>>,
    tasks: TaskRegistry,
    stopped: AtomicBool,
}

impl Runtime {
    /// Start building a runtime
    pub fn builder(config: NodeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Active configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Injected effects
    pub fn effects(&self) -> &Effects {
        &self.effects
    }

    /// Audit log
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Node identity
    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    /// Local vault
    pub fn vault(&self) -> &Arc<LocalVault> {
        &self.vault
    }

    /// On-device label index
    pub fn odx(&self) -> &OdxBuilder {
        &self.odx
    }

    /// Request inbox
    pub fn inbox(&self) -> &RequestInbox {
        &self.inbox
    }

    /// Active and revoked contracts
    pub fn contracts(&self) -> &ContractStore {
        &self.contracts
    }

    /// Local capsule copies
    pub fn capsules(&self) -> &Arc<CapsuleStore> {
        &self.capsules
    }

    /// Egress gate
    pub fn gate(&self) -> &Arc<NetworkGate> {
        &self.gate
    }

    /// Job admission
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Execution fence
    pub fn fence(&self) -> &ExecutionFence {
        &self.fence
    }

    /// Connector retry policy and cursors
    pub fn connector_sync(&self) -> &ConnectorSync {
        &self.sync
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(NodeError::cancelled("runtime is shut down"));
        }
        Ok(())
    }

    /// Store a raw item, then normalize, label and index it.
    ///
    /// The item stays in the vault even when no normalizer accepts it.
    pub fn ingest(&self, item: RawItem) -> Result<Ingested> {
        self.ensure_running()?;
        let raw_ref = self.vault.put(item)?;
        let labeled = match self.pipeline.process(&self.vault, &raw_ref) {
            Ok(event) => {
                self.odx.upsert(&event)?;
                true
            }
            Err(e) => {
                warn!(%raw_ref, error = %e, "stored item not indexed");
                false
            }
        };
        Ok(Ingested { raw_ref, labeled })
    }

    /// Crypto-shred a stored item and withdraw it from the index
    pub fn forget(&self, raw_ref: &RawRef) -> Result<()> {
        self.ensure_running()?;
        self.vault.delete(raw_ref)?;
        let retracted = self.odx.retract(raw_ref)?;
        info!(%raw_ref, retracted, "item forgotten");
        Ok(())
    }

    /// Shred expired capsules, purge expired vault objects along with their
    /// index observations, and drop expired requests
    pub fn maintenance(&self) -> Result<MaintenanceReport> {
        let now = self.effects.now_ms();
        let capsules_shredded = self.capsules.process_expired(now)?;
        let tombstones_pruned = self.capsules.prune_tombstones(
            now,
            self.config.capsule.tombstone_retention_secs.saturating_mul(1_000),
        );
        let purged = self.vault.purge_expired()?;
        let mut events_retracted = 0;
        for raw_ref in &purged {
            events_retracted += self.odx.retract(raw_ref)?;
        }
        let requests_dropped = self.inbox.cleanup_expired();
        let transfers_dropped = {
            let mut transfers = self.transfers.lock();
            let before = transfers.len();
            transfers.retain(|id, slot| {
                matches!(slot, TransferSlot::InFlight) || self.capsules.is_live(id)
            });
            before - transfers.len()
        };
        let report = MaintenanceReport {
            capsules_shredded,
            vault_purged: purged.len(),
            events_retracted,
            requests_dropped,
            transfers_dropped,
            tombstones_pruned,
        };
        debug!(?report, "maintenance sweep");
        Ok(report)
    }

    /// Run [`maintenance`](Self::maintenance) every `interval` until shutdown
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let runtime = Arc::clone(self);
        self.tasks.spawn_interval_until(interval, move || {
            let runtime = runtime.clone();
            async move {
                if runtime.is_stopped() {
                    return false;
                }
                if let Err(e) = runtime.maintenance() {
                    warn!(error = %e, "maintenance sweep failed");
                }
                true
            }
        });
    }

    /// Background tasks still running
    pub fn background_tasks(&self) -> usize {
        self.tasks.active()
    }

    /// Portable copy of the audit chain
    pub fn export_audit(&self) -> Result<AuditExport> {
        self.audit.export()
    }

    /// Recompute every hash in the audit chain
    pub fn verify_audit(&self) -> Result<ChainVerification> {
        self.audit.verify()
    }

    /// Register a requester endpoint that may receive sealed capsules
    pub fn register_destination(&self, domain: &str, purpose: &str) -> Result<()> {
        self.gate
            .register(domain, purpose, PayloadClass::CiphertextCapsule)
            .map(|_| ())
    }

    /// Stop background tasks and audit the stop; later calls are no-ops
    pub fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tasks.shutdown();
        self.audit.record(
            AuditRecord::new(AuditEventType::RuntimeStopped)
                .with("node_id", self.keyring.node_id()),
        )?;
        info!(node_id = %self.keyring.node_id(), "runtime stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node_id", &self.keyring.node_id())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use yachaq_crypto::MemoryKeyStore;
    use yachaq_testkit::{test_effects, trip_item, HOUR_MS};

    fn runtime(seed: u64) -> Runtime {
        let (effects, _) = test_effects(seed);
        Runtime::builder(NodeConfig::default())
            .with_effects(effects)
            .build()
            .unwrap()
    }

    #[test]
    fn test_boot_and_shutdown_are_audited() {
        let rt = runtime(1);
        rt.shutdown().unwrap();
        rt.shutdown().unwrap();
        let types = rt.export_audit().unwrap().event_types();
        assert_eq!(
            types,
            vec![AuditEventType::RuntimeStarted, AuditEventType::RuntimeStopped]
        );
        assert_matches!(rt.ingest(trip_item(0)), Err(NodeError::Cancelled { .. }));
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = NodeConfig::default();
        config.privacy.k_min = 0;
        assert_matches!(
            Runtime::builder(config).build(),
            Err(NodeError::Validation { .. })
        );
    }

    #[test]
    fn test_ingest_indexes_trip_and_keeps_unknown() {
        let rt = runtime(2);
        assert!(rt.ingest(trip_item(0)).unwrap().labeled);
        let odd = rt
            .ingest(RawItem::new("vendor", "mystery", b"{}".to_vec()))
            .unwrap();
        assert!(!odd.labeled);
        assert!(rt.vault().exists(&odd.raw_ref));
        assert_eq!(rt.odx().stats().events, 1);
    }

    #[test]
    fn test_identity_survives_restart_through_key_store() {
        let (effects, _) = test_effects(3);
        let store: Arc<dyn SecureKeyStore> = Arc::new(MemoryKeyStore::new());
        let first = Runtime::builder(NodeConfig::default())
            .with_effects(effects.clone())
            .with_key_store(store.clone(), [9u8; 32])
            .build()
            .unwrap();
        let second = Runtime::builder(NodeConfig::default())
            .with_effects(effects)
            .with_key_store(store, [9u8; 32])
            .build()
            .unwrap();
        assert_eq!(first.keyring().node_id(), second.keyring().node_id());
    }

    #[test]
    fn test_maintenance_purges_expired_vault_items() {
        let (effects, clock) = test_effects(4);
        let rt = Runtime::builder(NodeConfig::default())
            .with_effects(effects)
            .build()
            .unwrap();
        rt.ingest(trip_item(1).with_ttl_ms(HOUR_MS)).unwrap();
        rt.ingest(trip_item(2)).unwrap();

        clock.advance_ms(2 * HOUR_MS);
        let report = rt.maintenance().unwrap();
        assert_eq!(report.vault_purged, 1);
        assert_eq!(report.events_retracted, 1);
        assert_eq!(rt.vault().list("trip").len(), 1);
        assert_eq!(rt.odx().stats().events, 1);
    }
}
