//! Rendezvous relay for peers that cannot reach each other directly
//!
//! The relay pairs two links under a rendezvous id and forwards frames between
//! them without looking inside; the session keys never reach it. All it keeps is
//! a short-lived [`SignalingRecord`] per rendezvous.

use crate::link::FrameLink;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use yachaq_core::time::MS_PER_SEC;
use yachaq_core::{Effects, NodeError, Result};

/// What the relay remembers about a rendezvous
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingRecord {
    /// Rendezvous id
    pub rendezvous_id: String,
    /// When the first peer arrived
    pub created_at_ms: u64,
    /// When an unjoined rendezvous is dropped
    pub expires_at_ms: u64,
    /// Whether the second peer arrived
    pub joined: bool,
}

/// Relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Frames forwarded
    pub frames_forwarded: u64,
    /// Bytes forwarded
    pub bytes_forwarded: u64,
    /// Rendezvous opened
    pub opened: u64,
    /// Rendezvous dropped unjoined
    pub expired: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Opener,
    Joiner,
}

struct Room {
    record: SignalingRecord,
    to_opener: mpsc::UnboundedSender<Vec<u8>>,
    to_joiner: mpsc::UnboundedSender<Vec<u8>>,
    joiner_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// In-process relay
pub struct Relay {
    rooms: Mutex<BTreeMap<String, Room>>,
    stats: Mutex<RelayStats>,
    record_ttl_ms: u64,
    effects: Effects,
}

impl Relay {
    /// Relay dropping unjoined rendezvous after `record_ttl_secs`
    pub fn new(effects: Effects, record_ttl_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(RelayStats::default()),
            record_ttl_ms: record_ttl_secs * MS_PER_SEC,
            effects,
        })
    }

    /// Open a rendezvous and return the first peer's link
    pub fn open(self: &Arc<Self>, rendezvous_id: &str) -> Result<RelayLink> {
        self.sweep();
        let mut rooms = self.rooms.lock();
        if rooms.contains_key(rendezvous_id) {
            return Err(NodeError::validation(format!(
                "rendezvous {rendezvous_id} already open"
            )));
        }
        let now = self.effects.now_ms();
        let (to_opener, opener_rx) = mpsc::unbounded_channel();
        let (to_joiner, joiner_rx) = mpsc::unbounded_channel();
        rooms.insert(
            rendezvous_id.to_string(),
            Room {
                record: SignalingRecord {
                    rendezvous_id: rendezvous_id.to_string(),
                    created_at_ms: now,
                    expires_at_ms: now + self.record_ttl_ms,
                    joined: false,
                },
                to_opener,
                to_joiner,
                joiner_rx: Some(joiner_rx),
            },
        );
        self.stats.lock().opened += 1;
        debug!(rendezvous_id, "rendezvous opened");
        Ok(self.link(rendezvous_id, Side::Opener, opener_rx))
    }

    /// Join an open rendezvous as the second peer
    pub fn join(self: &Arc<Self>, rendezvous_id: &str) -> Result<RelayLink> {
        self.sweep();
        let mut rooms = self.rooms.lock();
        let room = rooms
            .get_mut(rendezvous_id)
            .ok_or_else(|| NodeError::not_found(format!("rendezvous {rendezvous_id}")))?;
        let rx = room.joiner_rx.take().ok_or_else(|| {
            NodeError::validation(format!("rendezvous {rendezvous_id} already joined"))
        })?;
        room.record.joined = true;
        debug!(rendezvous_id, "rendezvous joined");
        Ok(self.link(rendezvous_id, Side::Joiner, rx))
    }

    fn link(
        self: &Arc<Self>,
        rendezvous_id: &str,
        side: Side,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> RelayLink {
        RelayLink {
            relay: Arc::clone(self),
            rendezvous_id: rendezvous_id.to_string(),
            side,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Signaling record for a rendezvous
    pub fn record(&self, rendezvous_id: &str) -> Option<SignalingRecord> {
        self.rooms
            .lock()
            .get(rendezvous_id)
            .map(|room| room.record.clone())
    }

    /// Drop unjoined rendezvous past their expiry; returns how many
    pub fn sweep(&self) -> usize {
        let now = self.effects.now_ms();
        let mut rooms = self.rooms.lock();
        let before = rooms.len();
        rooms.retain(|_, room| room.record.joined || now < room.record.expires_at_ms);
        let dropped = before - rooms.len();
        self.stats.lock().expired += dropped as u64;
        dropped
    }

    /// Tear a rendezvous down; both links see the connection drop
    pub fn close(&self, rendezvous_id: &str) -> bool {
        self.rooms.lock().remove(rendezvous_id).is_some()
    }

    /// Counters
    pub fn stats(&self) -> RelayStats {
        *self.stats.lock()
    }

    fn forward(&self, rendezvous_id: &str, from: Side, frame: Vec<u8>) -> Result<()> {
        let len = frame.len() as u64;
        {
            let rooms = self.rooms.lock();
            let room = rooms
                .get(rendezvous_id)
                .ok_or_else(|| NodeError::transient(format!("rendezvous {rendezvous_id} closed")))?;
            let target = match from {
                Side::Opener => &room.to_joiner,
                Side::Joiner => &room.to_opener,
            };
            target
                .send(frame)
                .map_err(|_| NodeError::transient("relay peer gone"))?;
        }
        let mut stats = self.stats.lock();
        stats.frames_forwarded += 1;
        stats.bytes_forwarded += len;
        Ok(())
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("rooms", &self.rooms.lock().len())
            .finish_non_exhaustive()
    }
}

/// One peer's end of a relayed connection
pub struct RelayLink {
    relay: Arc<Relay>,
    rendezvous_id: String,
    side: Side,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl FrameLink for RelayLink {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.relay.forward(&self.rendezvous_id, self.side, frame)
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| NodeError::transient(format!("rendezvous {} closed", self.rendezvous_id)))
    }
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("rendezvous_id", &self.rendezvous_id)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_forwards_both_ways() {
        let (effects, _) = Effects::deterministic(1, 0);
        let relay = Relay::new(effects, 300);
        let device = relay.open("rv-1").unwrap();
        let requester = relay.join("rv-1").unwrap();

        device.send(vec![0xAA; 32]).await.unwrap();
        requester.send(vec![0xBB; 8]).await.unwrap();
        assert_eq!(requester.recv().await.unwrap(), vec![0xAA; 32]);
        assert_eq!(device.recv().await.unwrap(), vec![0xBB; 8]);

        let stats = relay.stats();
        assert_eq!(stats.frames_forwarded, 2);
        assert_eq!(stats.bytes_forwarded, 40);
        assert!(relay.record("rv-1").unwrap().joined);
    }

    #[tokio::test]
    async fn test_unjoined_record_expires() {
        let (effects, clock) = Effects::deterministic(1, 0);
        let relay = Relay::new(effects, 300);
        let _device = relay.open("rv-2").unwrap();
        assert_matches!(relay.open("rv-2"), Err(NodeError::Validation { .. }));

        clock.advance_secs(301);
        assert_eq!(relay.sweep(), 1);
        assert!(relay.record("rv-2").is_none());
        assert_matches!(relay.join("rv-2"), Err(NodeError::NotFound { .. }));
        assert_eq!(relay.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_close_drops_link() {
        let (effects, _) = Effects::deterministic(1, 0);
        let relay = Relay::new(effects, 300);
        let device = relay.open("rv-3").unwrap();
        let requester = relay.join("rv-3").unwrap();
        assert!(relay.close("rv-3"));
        assert_matches!(device.send(vec![1]).await, Err(NodeError::Transient { .. }));
        assert_matches!(requester.recv().await, Err(NodeError::Transient { .. }));
    }
}
