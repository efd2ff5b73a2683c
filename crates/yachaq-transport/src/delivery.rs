//! Async drivers: handshake over a link, then capsule transfer

use crate::handshake::{
    HandshakeFinish, HandshakeInit, HandshakeResponse, Initiator, PeerSigner, Responder,
};
use crate::link::FrameLink;
use crate::session::SecureSession;
use crate::transfer::{
    DeliveryReceipt, IncomingTransfer, OutgoingTransfer, ReceiptStatus, TransferMessage,
};
use crate::wire;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use yachaq_capsule::TimeCapsule;
use yachaq_core::{
    AuditEventType, AuditRecord, AuditSink, CancellationToken, Effects, NodeError, Result,
    TransferId,
};
use yachaq_crypto::PublicKey;

/// Run the initiator side of the handshake over `link`
pub async fn initiate(
    link: &dyn FrameLink,
    signer: &dyn PeerSigner,
    expected_peer: &PublicKey,
    effects: &Effects,
    session_ttl_ms: u64,
) -> Result<SecureSession> {
    let (initiator, init) = Initiator::start(effects);
    link.send(wire::encode(&init)?).await?;
    let response: HandshakeResponse = wire::decode(&link.recv().await?)?;
    let (session, finish) = initiator.finish(
        &response,
        signer,
        expected_peer,
        effects.now_ms() + session_ttl_ms,
    )?;
    link.send(wire::encode(&finish)?).await?;
    Ok(session)
}

/// Run the responder side of the handshake over `link`
pub async fn accept(
    link: &dyn FrameLink,
    signer: &dyn PeerSigner,
    expected_peer: &PublicKey,
    effects: &Effects,
    session_ttl_ms: u64,
) -> Result<SecureSession> {
    let init: HandshakeInit = wire::decode(&link.recv().await?)?;
    let (responder, response) = Responder::respond(init, signer, effects)?;
    link.send(wire::encode(&response)?).await?;
    let finish: HandshakeFinish = wire::decode(&link.recv().await?)?;
    responder.complete(&finish, expected_peer, effects.now_ms() + session_ttl_ms)
}

async fn send_message(
    link: &dyn FrameLink,
    session: &mut SecureSession,
    message: &TransferMessage,
) -> Result<()> {
    let frame = session.seal(&wire::encode(message)?)?;
    link.send(frame).await
}

async fn recv_message(link: &dyn FrameLink, session: &mut SecureSession) -> Result<TransferMessage> {
    let frame = link.recv().await?;
    wire::decode(&session.open(&frame)?)
}

fn unexpected(message: &TransferMessage) -> NodeError {
    let name = match message {
        TransferMessage::ResumeQuery { .. } => "resume query",
        TransferMessage::ResumeOffer { .. } => "resume offer",
        TransferMessage::Manifest(_) => "manifest",
        TransferMessage::Chunk { .. } => "chunk",
        TransferMessage::Ack { .. } => "ack",
        TransferMessage::Receipt(_) => "receipt",
        TransferMessage::Cancel { .. } => "cancel",
    };
    NodeError::validation(format!("unexpected {name} message"))
}

/// Device side of a capsule transfer
pub struct CapsuleSender {
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl CapsuleSender {
    /// Sender auditing to `audit`
    pub fn new(audit: Arc<dyn AuditSink>, effects: Effects) -> Self {
        Self { audit, effects }
    }

    /// Send `transfer` over `session`, resuming from whatever the receiver
    /// already holds. Returns the verified receipt.
    ///
    /// On failure the transfer keeps its acknowledged offset, so a later call on
    /// a new session continues where this one stopped.
    pub async fn deliver(
        &self,
        link: &dyn FrameLink,
        session: &mut SecureSession,
        transfer: &mut OutgoingTransfer,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt> {
        match self.run(link, session, transfer, cancel).await {
            Ok(receipt) => {
                self.audit.append(
                    AuditRecord::new(AuditEventType::CapsuleDelivered)
                        .with("capsule_id", receipt.capsule_id)
                        .with("transfer_id", receipt.transfer_id)
                        .with("chunks", receipt.total_chunks),
                )?;
                info!(
                    transfer_id = %receipt.transfer_id,
                    capsule_id = %receipt.capsule_id,
                    "capsule delivered"
                );
                Ok(receipt)
            }
            Err(e) => {
                warn!(
                    transfer_id = %transfer.transfer_id(),
                    acked = transfer.acked(),
                    error = %e,
                    "transfer aborted"
                );
                self.audit.append(
                    AuditRecord::new(AuditEventType::TransferAborted)
                        .with("transfer_id", transfer.transfer_id())
                        .with("capsule_id", transfer.manifest().capsule_id)
                        .with("acked", transfer.acked())
                        .with("reason", e.kind()),
                )?;
                Err(e)
            }
        }
    }

    fn check_session(&self, session: &SecureSession) -> Result<()> {
        if session.is_expired(self.effects.now_ms()) {
            return Err(NodeError::ttl_expired(format!(
                "session {} expired",
                session.session_id()
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        link: &dyn FrameLink,
        session: &mut SecureSession,
        transfer: &mut OutgoingTransfer,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt> {
        let transfer_id = transfer.transfer_id();
        self.check_session(session)?;
        send_message(link, session, &TransferMessage::ResumeQuery { transfer_id }).await?;
        match recv_message(link, session).await? {
            TransferMessage::ResumeOffer {
                transfer_id: offered,
                known,
                next_index,
            } if offered == transfer_id => {
                if known {
                    transfer.record_ack(next_index)?;
                    debug!(transfer_id = %transfer_id, next_index, "resuming transfer");
                } else {
                    transfer.record_ack(0)?;
                    send_message(
                        link,
                        session,
                        &TransferMessage::Manifest(transfer.manifest().clone()),
                    )
                    .await?;
                }
            }
            other => return Err(unexpected(&other)),
        }

        while !transfer.is_acknowledged() {
            if let Err(e) = cancel.checkpoint("transfer.chunk") {
                let notice = TransferMessage::Cancel {
                    transfer_id,
                    reason: "cancelled by sender".into(),
                };
                // best effort; the receiver keeps its partial state either way
                let _ = send_message(link, session, &notice).await;
                return Err(e);
            }
            self.check_session(session)?;
            let index = transfer.acked();
            let chunk = transfer
                .chunk(index)
                .ok_or_else(|| NodeError::internal(format!("chunk {index} missing")))?;
            send_message(link, session, &chunk).await?;
            match recv_message(link, session).await? {
                TransferMessage::Ack {
                    transfer_id: acked,
                    next_index,
                } if acked == transfer_id && next_index > index => {
                    transfer.record_ack(next_index)?;
                }
                TransferMessage::Receipt(receipt) => {
                    receipt.verify(session.peer(), transfer.manifest())?;
                    return Err(NodeError::integrity(format!(
                        "receiver reported {:?} at chunk {index}",
                        receipt.status
                    )));
                }
                other => return Err(unexpected(&other)),
            }
        }

        match recv_message(link, session).await? {
            TransferMessage::Receipt(receipt) => {
                receipt.verify(session.peer(), transfer.manifest())?;
                match receipt.status {
                    ReceiptStatus::Confirmed => Ok(receipt),
                    status => Err(NodeError::integrity(format!(
                        "receiver reported {status:?}"
                    ))),
                }
            }
            other => Err(unexpected(&other)),
        }
    }
}

impl std::fmt::Debug for CapsuleSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleSender").finish_non_exhaustive()
    }
}

/// Requester side of a capsule transfer; keeps partial transfers for resume
pub struct CapsuleReceiver {
    transfers: Mutex<BTreeMap<TransferId, IncomingTransfer>>,
    max_size: u64,
    effects: Effects,
}

impl CapsuleReceiver {
    /// Receiver accepting capsules up to `max_size` bytes
    pub fn new(effects: Effects, max_size: u64) -> Self {
        Self {
            transfers: Mutex::new(BTreeMap::new()),
            max_size,
            effects,
        }
    }

    /// Chunks held for an unfinished transfer
    pub fn progress(&self, transfer_id: &TransferId) -> Option<u32> {
        self.transfers
            .lock()
            .get(transfer_id)
            .map(IncomingTransfer::next_index)
    }

    /// Serve one transfer over `session` until the capsule is complete, the
    /// sender cancels or the link drops. Receipts are signed by `signer`.
    pub async fn serve(
        &self,
        link: &dyn FrameLink,
        session: &mut SecureSession,
        signer: &dyn PeerSigner,
    ) -> Result<(TimeCapsule, DeliveryReceipt)> {
        loop {
            match recv_message(link, session).await? {
                TransferMessage::ResumeQuery { transfer_id } => {
                    let next = self.progress(&transfer_id);
                    let offer = TransferMessage::ResumeOffer {
                        transfer_id,
                        known: next.is_some(),
                        next_index: next.unwrap_or(0),
                    };
                    send_message(link, session, &offer).await?;
                }
                TransferMessage::Manifest(manifest) => {
                    let incoming = IncomingTransfer::new(manifest, self.max_size)?;
                    self.transfers
                        .lock()
                        .entry(incoming.manifest().transfer_id)
                        .or_insert(incoming);
                }
                TransferMessage::Chunk {
                    transfer_id,
                    index,
                    data,
                    hash,
                } => {
                    let accepted = {
                        let mut transfers = self.transfers.lock();
                        let incoming = transfers.get_mut(&transfer_id).ok_or_else(|| {
                            NodeError::validation(format!("chunk for unknown {transfer_id}"))
                        })?;
                        incoming
                            .accept(index, &data, &hash)
                            .map(|next| (next, incoming.is_complete()))
                    };
                    match accepted {
                        Ok((next_index, complete)) => {
                            if complete {
                                return self.complete(link, session, signer, transfer_id).await;
                            }
                            let ack = TransferMessage::Ack {
                                transfer_id,
                                next_index,
                            };
                            send_message(link, session, &ack).await?;
                        }
                        Err(e) => {
                            self.reject(link, session, signer, transfer_id).await?;
                            return Err(e);
                        }
                    }
                }
                TransferMessage::Cancel {
                    transfer_id,
                    reason,
                } => {
                    return Err(NodeError::cancelled(format!("{transfer_id}: {reason}")));
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    async fn complete(
        &self,
        link: &dyn FrameLink,
        session: &mut SecureSession,
        signer: &dyn PeerSigner,
        transfer_id: TransferId,
    ) -> Result<(TimeCapsule, DeliveryReceipt)> {
        let incoming = self
            .transfers
            .lock()
            .remove(&transfer_id)
            .ok_or_else(|| NodeError::internal(format!("{transfer_id} vanished")))?;
        let manifest = incoming.manifest();
        let chunks = manifest.total_chunks();
        let ack = TransferMessage::Ack {
            transfer_id,
            next_index: chunks,
        };
        send_message(link, session, &ack).await?;
        let (status, outcome) = match incoming.finish() {
            Ok(capsule) => (ReceiptStatus::Confirmed, Ok(capsule)),
            Err(e) => (ReceiptStatus::Rejected, Err(e)),
        };
        let receipt =
            DeliveryReceipt::sign(manifest, status, chunks, self.effects.now_ms(), signer)?;
        send_message(link, session, &TransferMessage::Receipt(receipt.clone())).await?;
        outcome.map(|capsule| (capsule, receipt))
    }

    async fn reject(
        &self,
        link: &dyn FrameLink,
        session: &mut SecureSession,
        signer: &dyn PeerSigner,
        transfer_id: TransferId,
    ) -> Result<()> {
        let Some(incoming) = self.transfers.lock().remove(&transfer_id) else {
            return Ok(());
        };
        let receipt = DeliveryReceipt::sign(
            incoming.manifest(),
            ReceiptStatus::Rejected,
            incoming.next_index(),
            self.effects.now_ms(),
            signer,
        )?;
        send_message(link, session, &TransferMessage::Receipt(receipt)).await
    }
}

impl std::fmt::Debug for CapsuleReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleReceiver")
            .field("pending", &self.transfers.lock().len())
            .finish_non_exhaustive()
    }
}
