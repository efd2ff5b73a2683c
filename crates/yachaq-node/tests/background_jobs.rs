//! Connector sync with retries and cursor checkpoints, device-state
//! admission, and the file-backed audit chain across restarts

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use yachaq_audit::{read_chain_file, verify_chain, FileAuditStore};
use yachaq_core::config::{BackoffConfig, NodeConfig};
use yachaq_core::{
    AuditEventType, DeviceState, Effects, NetworkType, NodeError, Result, StaticDeviceState,
};
use yachaq_node::{Connector, Runtime, SyncBatch};
use yachaq_testkit::{test_effects, trip_item};
use yachaq_vault::RawItem;

/// Three pages of three trips, keyed by cursor
struct Paged {
    seen: Mutex<Vec<Option<String>>>,
    transient_failures: Mutex<u32>,
    fail_on: Option<&'static str>,
}

impl Paged {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            transient_failures: Mutex::new(0),
            fail_on: None,
        }
    }

    fn flaky(failures: u32) -> Self {
        Self {
            transient_failures: Mutex::new(failures),
            ..Self::new()
        }
    }

    fn broken_at(cursor: &'static str) -> Self {
        Self {
            fail_on: Some(cursor),
            ..Self::new()
        }
    }

    fn seen(&self) -> Vec<Option<String>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Connector for Paged {
    fn id(&self) -> &str {
        "strava"
    }

    async fn sync(&self, cursor: Option<&str>) -> Result<SyncBatch> {
        self.seen.lock().push(cursor.map(str::to_string));
        if cursor.is_some() && cursor == self.fail_on {
            return Err(NodeError::integrity("page signature mismatch"));
        }
        {
            let mut failures = self.transient_failures.lock();
            if cursor == Some("p1") && *failures > 0 {
                *failures -= 1;
                return Err(NodeError::transient("gateway timeout"));
            }
        }
        let (page, next, has_more) = match cursor {
            None => (0, "p1", true),
            Some("p1") => (1, "p2", true),
            Some("p2") => (2, "p3", false),
            Some(other) => return Err(NodeError::not_found(format!("cursor {other}"))),
        };
        Ok(SyncBatch {
            items: (page * 3..page * 3 + 3).map(trip_item).collect(),
            next_cursor: Some(next.to_string()),
            has_more,
        })
    }
}

fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.connectors = BackoffConfig {
        base_delay_ms: 1,
        max_delay_ms: 4,
        multiplier: 2.0,
        max_attempts: 3,
    };
    config
}

fn runtime(effects: &Effects, cursors: &Path) -> Runtime {
    Runtime::builder(fast_config())
        .with_effects(effects.clone())
        .with_cursor_checkpoints(cursors)
        .build()
        .unwrap()
}

#[tokio::test]
async fn sync_pages_retries_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let cursors = dir.path().join("cursors.json");
    let (effects, _) = test_effects(20);
    let rt = runtime(&effects, &cursors);
    let connector = Paged::flaky(1);

    let report = rt.sync_connector(&connector).await.unwrap();
    assert_eq!(report.pages, 3);
    assert_eq!(report.stored.len(), 9);
    assert_eq!(report.unlabeled, 0);
    assert_eq!(report.attempts, 4);
    assert_eq!(report.cursor.as_deref(), Some("p3"));
    assert_eq!(
        connector.seen(),
        vec![None, Some("p1".into()), Some("p1".into()), Some("p2".into())]
    );
    assert_eq!(rt.vault().stats().objects, 9);

    let export = rt.export_audit().unwrap();
    let synced = export.of_type(AuditEventType::ConnectorSynced);
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].references["items"], "9");
    assert_eq!(synced[0].references["pages"], "3");

    rt.shutdown().unwrap();
    let restarted = runtime(&effects, &cursors);
    assert_eq!(
        restarted.connector_sync().cursor("strava").as_deref(),
        Some("p3")
    );
}

#[tokio::test]
async fn failed_sync_resumes_after_last_stored_page() {
    let dir = tempfile::tempdir().unwrap();
    let cursors = dir.path().join("cursors.json");
    let (effects, _) = test_effects(21);

    let rt = runtime(&effects, &cursors);
    let broken = Paged::broken_at("p2");
    assert_matches!(
        rt.sync_connector(&broken).await,
        Err(NodeError::IntegrityFailure { .. })
    );
    assert_eq!(broken.seen().len(), 3, "integrity failures are not retried");
    assert_eq!(rt.vault().stats().objects, 6);
    assert_eq!(rt.connector_sync().cursor("strava").as_deref(), Some("p2"));
    let export = rt.export_audit().unwrap();
    assert!(export.of_type(AuditEventType::ConnectorSynced).is_empty());
    rt.shutdown().unwrap();

    let rt = runtime(&effects, &cursors);
    let healthy = Paged::new();
    let report = rt.sync_connector(&healthy).await.unwrap();
    assert_eq!(healthy.seen(), vec![Some("p2".to_string())]);
    assert_eq!(report.pages, 1);
    assert_eq!(report.stored.len(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_the_transient_error() {
    let dir = tempfile::tempdir().unwrap();
    let (effects, _) = test_effects(22);
    let rt = runtime(&effects, &dir.path().join("cursors.json"));
    let connector = Paged::flaky(10);

    assert_matches!(
        rt.sync_connector(&connector).await,
        Err(NodeError::Transient { .. })
    );
    // first page, then three attempts at the second
    assert_eq!(connector.seen().len(), 4);
    assert_eq!(rt.connector_sync().cursor("strava").as_deref(), Some("p1"));
}

#[tokio::test]
async fn unreadable_items_are_kept_but_not_indexed() {
    struct Notes;

    #[async_trait]
    impl Connector for Notes {
        fn id(&self) -> &str {
            "notes"
        }

        async fn sync(&self, _cursor: Option<&str>) -> Result<SyncBatch> {
            Ok(SyncBatch {
                items: vec![
                    trip_item(0),
                    RawItem::new("notes", "memo", b"buy milk".to_vec()),
                ],
                next_cursor: None,
                has_more: false,
            })
        }
    }

    let (effects, _) = test_effects(23);
    let rt = Runtime::builder(fast_config())
        .with_effects(effects)
        .build()
        .unwrap();
    let report = rt.sync_connector(&Notes).await.unwrap();
    assert_eq!(report.stored.len(), 2);
    assert_eq!(report.unlabeled, 1);
    assert_eq!(report.cursor, None);
    assert_eq!(rt.vault().stats().objects, 2);
}

#[tokio::test]
async fn metered_network_defers_sync() {
    let (effects, _) = test_effects(24);
    let device = Arc::new(StaticDeviceState::new(DeviceState {
        network: NetworkType::Any,
        ..DeviceState::default()
    }));
    let rt = Runtime::builder(fast_config())
        .with_effects(effects)
        .with_device(device.clone())
        .build()
        .unwrap();
    let connector = Paged::new();

    assert_matches!(
        rt.sync_connector(&connector).await,
        Err(NodeError::Deferred { .. })
    );
    assert!(connector.seen().is_empty());

    device.update(|state| state.network = NetworkType::Unmetered);
    let report = rt.sync_connector(&connector).await.unwrap();
    assert_eq!(report.pages, 3);
    let stats = rt.scheduler().stats();
    assert_eq!((stats.admitted, stats.deferred), (1, 1));
}

#[tokio::test]
async fn maintenance_task_stops_with_the_runtime() {
    let (effects, _) = test_effects(25);
    let rt = Arc::new(
        Runtime::builder(NodeConfig::default())
            .with_effects(effects)
            .build()
            .unwrap(),
    );
    rt.start_maintenance(std::time::Duration::from_millis(5));
    assert_eq!(rt.background_tasks(), 1);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    rt.shutdown().unwrap();
    assert_eq!(rt.background_tasks(), 0);
}

#[test]
fn audit_chain_survives_restart_and_detects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let (effects, _) = test_effects(26);
    let open = |effects: &Effects| {
        Runtime::builder(NodeConfig::default())
            .with_effects(effects.clone())
            .with_audit_store(Arc::new(FileAuditStore::open(&path).unwrap()))
            .build()
    };

    let rt = open(&effects).unwrap();
    rt.ingest(trip_item(0)).unwrap();
    rt.shutdown().unwrap();
    drop(rt);

    let entries = read_chain_file(&path).unwrap();
    assert!(verify_chain(&entries).is_valid());
    assert_eq!(entries[0].event_type, AuditEventType::RuntimeStarted);
    assert_eq!(
        entries.last().map(|e| e.event_type),
        Some(AuditEventType::RuntimeStopped)
    );

    let rt = open(&effects).unwrap();
    assert_eq!(rt.audit().len(), entries.len() as u64 + 1);
    rt.shutdown().unwrap();
    drop(rt);

    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    assert!(lines.len() >= 3);
    lines.remove(1);
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    assert_matches!(open(&effects), Err(NodeError::IntegrityFailure { .. }));
}
