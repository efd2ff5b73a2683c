//! Frame links: the byte pipes sessions run over

use crate::gate::{NetworkGate, Outbound};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use yachaq_core::{NodeError, Result};

/// Ordered, reliable delivery of opaque frames to one peer
#[async_trait]
pub trait FrameLink: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Wait for the next frame
    async fn recv(&self) -> Result<Vec<u8>>;
}

/// In-process link over unbounded channels
pub struct MemoryLink {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    remaining: AtomicUsize,
}

impl MemoryLink {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            remaining: AtomicUsize::new(usize::MAX),
        }
    }

    /// Drop the connection after `frames` more sends from this end
    pub fn cut_after(&self, frames: usize) {
        self.remaining.store(frames, Ordering::SeqCst);
        if frames == 0 {
            self.close();
        }
    }

    /// Close this end's sending half; the peer sees the link drop
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

#[async_trait]
impl FrameLink for MemoryLink {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let mut tx = self.tx.lock();
        let sender = tx
            .as_ref()
            .ok_or_else(|| NodeError::transient("link closed"))?;
        sender
            .send(frame)
            .map_err(|_| NodeError::transient("peer hung up"))?;
        let left = self.remaining.load(Ordering::SeqCst);
        if left != usize::MAX {
            self.remaining.store(left.saturating_sub(1), Ordering::SeqCst);
            if left <= 1 {
                tx.take();
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| NodeError::transient("link closed by peer"))
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("open", &self.tx.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Link whose every outbound frame is authorized by the network gate
pub struct GatedLink<L> {
    inner: L,
    gate: Arc<NetworkGate>,
    destination: String,
}

impl<L: FrameLink> GatedLink<L> {
    /// Wrap `inner`, sending to `destination`
    pub fn new(inner: L, gate: Arc<NetworkGate>, destination: impl Into<String>) -> Self {
        Self {
            inner,
            gate,
            destination: destination.into(),
        }
    }

    /// The wrapped link
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: FrameLink> FrameLink for GatedLink<L> {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.gate
            .authorize(&self.destination, Outbound::Ciphertext(&frame))?;
        self.inner.send(frame).await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.inner.recv().await
    }
}
