//! Connector sync with retry backoff and per-connector cursor checkpoints
//!
//! Connectors only ever see their own cursor; raw items go straight to the vault
//! through the runtime. No lock is held while a connector call is in flight.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use yachaq_core::config::BackoffConfig;
use yachaq_core::{NodeError, RawRef, Result};
use yachaq_vault::RawItem;

/// One page returned by a connector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBatch {
    /// Raw records with their source
    pub items: Vec<RawItem>,
    /// Cursor to resume from next time
    pub next_cursor: Option<String>,
    /// Whether another page is ready now
    pub has_more: bool,
}

/// A data source such as a fitness or health platform
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable connector id, used as the checkpoint key
    fn id(&self) -> &str;

    /// Fetch records after `cursor`
    async fn sync(&self, cursor: Option<&str>) -> Result<SyncBatch>;
}

/// Outcome of one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Connector id
    pub connector_id: String,
    /// Pages fetched
    pub pages: u32,
    /// Raw items stored
    pub stored: Vec<RawRef>,
    /// Stored items the pipeline could not label
    pub unlabeled: usize,
    /// Connector calls including retries
    pub attempts: u32,
    /// Checkpointed cursor after the run
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    cursors: BTreeMap<String, String>,
}

/// Retry policy and cursor checkpoints shared by every connector
#[derive(Debug)]
pub struct ConnectorSync {
    backoff: BackoffConfig,
    cursors: Mutex<BTreeMap<String, String>>,
    checkpoint_path: Option<PathBuf>,
}

impl ConnectorSync {
    /// Cursors kept in memory only
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            cursors: Mutex::new(BTreeMap::new()),
            checkpoint_path: None,
        }
    }

    /// Cursors loaded from and saved to `path`
    pub fn with_checkpoints(backoff: BackoffConfig, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cursors = if path.exists() {
            let file: CheckpointFile = serde_json::from_slice(&std::fs::read(&path)?)?;
            debug!(
                path = %path.display(),
                connectors = file.cursors.len(),
                "loaded sync cursors"
            );
            file.cursors
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            backoff,
            cursors: Mutex::new(cursors),
            checkpoint_path: Some(path),
        })
    }

    /// Last checkpointed cursor for a connector
    pub fn cursor(&self, connector_id: &str) -> Option<String> {
        self.cursors.lock().get(connector_id).cloned()
    }

    /// Record a cursor and write the checkpoint file if there is one
    pub fn checkpoint(&self, connector_id: &str, cursor: Option<String>) -> Result<()> {
        let snapshot = {
            let mut cursors = self.cursors.lock();
            match cursor {
                Some(cursor) => cursors.insert(connector_id.to_string(), cursor),
                None => cursors.remove(connector_id),
            };
            cursors.clone()
        };
        if let Some(path) = &self.checkpoint_path {
            write_checkpoints(path, snapshot)?;
        }
        Ok(())
    }

    /// Call `connector` until it answers, a non-retryable error comes back, or
    /// attempts run out. Returns the batch and the attempts used.
    pub async fn fetch(
        &self,
        connector: &dyn Connector,
        cursor: Option<&str>,
    ) -> Result<(SyncBatch, u32)> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match connector.sync(cursor).await {
                Ok(batch) => return Ok((batch, attempt)),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff.delay_ms(attempt);
                    warn!(
                        connector = connector.id(),
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "connector sync failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        connector = connector.id(),
                        attempt,
                        error = %e,
                        "connector sync gave up"
                    );
                    return Err(e);
                }
            }
        }
    }
}

fn write_checkpoints(path: &Path, cursors: BTreeMap<String, String>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&CheckpointFile { cursors })?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        NodeError::storage(format!("checkpoint {} not written: {e}", path.display()))
    })?;
    info!(path = %path.display(), "sync cursors checkpointed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> NodeError,
    }

    #[async_trait]
    impl Connector for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn sync(&self, _cursor: Option<&str>) -> Result<SyncBatch> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(SyncBatch {
                next_cursor: Some("c1".into()),
                ..SyncBatch::default()
            })
        }
    }

    fn fast() -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 1,
            max_delay_ms: 4,
            multiplier: 2.0,
            max_attempts: 4,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let sync = ConnectorSync::new(fast());
        let connector = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: || NodeError::transient("timeout"),
        };
        let (batch, attempts) = sync.fetch(&connector, None).await.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(batch.next_cursor.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let sync = ConnectorSync::new(fast());
        let connector = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: || NodeError::transient("timeout"),
        };
        assert_matches!(
            sync.fetch(&connector, None).await,
            Err(NodeError::Transient { .. })
        );
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_integrity_failure_is_not_retried() {
        let sync = ConnectorSync::new(fast());
        let connector = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            error: || NodeError::integrity("bad signature"),
        };
        assert_matches!(
            sync.fetch(&connector, None).await,
            Err(NodeError::IntegrityFailure { .. })
        );
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_checkpoints_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");

        let sync = ConnectorSync::with_checkpoints(fast(), &path).unwrap();
        sync.checkpoint("strava", Some("page-7".into())).unwrap();
        sync.checkpoint("health", Some("h-2".into())).unwrap();
        sync.checkpoint("health", None).unwrap();

        let reloaded = ConnectorSync::with_checkpoints(fast(), &path).unwrap();
        assert_eq!(reloaded.cursor("strava").as_deref(), Some("page-7"));
        assert_eq!(reloaded.cursor("health"), None);
    }
}
