//! Chunked capsule transfer state and delivery receipts

use crate::handshake::PeerSigner;
use serde::{Deserialize, Serialize};
use yachaq_capsule::TimeCapsule;
use yachaq_core::{to_canonical_bytes, CapsuleId, NodeError, Result, TransferId};
use yachaq_crypto::{sha256, verify_signature, Digest, PublicKey, SignatureBytes};

const RECEIPT_DOMAIN: &[u8] = b"yachaq-delivery-receipt-v1";

/// What is being sent and how it is cut up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    /// Transfer id, stable across resumed sessions
    pub transfer_id: TransferId,
    /// Capsule carried
    pub capsule_id: CapsuleId,
    /// Capsule hash from its proofs
    pub capsule_hash: Digest,
    /// Serialized capsule size
    pub total_size: u64,
    /// Bytes per chunk (the last may be shorter)
    pub chunk_size: u32,
    /// SHA-256 of every chunk
    pub chunk_hashes: Vec<Digest>,
}

impl TransferManifest {
    /// Number of chunks
    pub fn total_chunks(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    fn expected_len(&self, index: u32) -> u64 {
        let start = u64::from(index) * u64::from(self.chunk_size);
        (self.total_size - start).min(u64::from(self.chunk_size))
    }
}

/// Messages exchanged inside a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    /// Ask whether the receiver already holds part of a transfer
    ResumeQuery {
        /// Transfer id
        transfer_id: TransferId,
    },
    /// Receiver's answer: next chunk it needs
    ResumeOffer {
        /// Transfer id
        transfer_id: TransferId,
        /// Whether the receiver knows the manifest
        known: bool,
        /// First chunk not yet held
        next_index: u32,
    },
    /// Transfer description
    Manifest(TransferManifest),
    /// One chunk
    Chunk {
        /// Transfer id
        transfer_id: TransferId,
        /// Chunk index
        index: u32,
        /// Chunk bytes
        data: Vec<u8>,
        /// SHA-256 of `data`
        hash: Digest,
    },
    /// Cumulative acknowledgement
    Ack {
        /// Transfer id
        transfer_id: TransferId,
        /// Every chunk below this index is held
        next_index: u32,
    },
    /// Signed outcome
    Receipt(DeliveryReceipt),
    /// Sender gave up
    Cancel {
        /// Transfer id
        transfer_id: TransferId,
        /// Reason
        reason: String,
    },
}

/// Sender-side transfer state; survives the session it started in
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    manifest: TransferManifest,
    payload: Vec<u8>,
    acked: u32,
    chunks_sent: u64,
}

impl OutgoingTransfer {
    /// Cut `capsule` into chunks of `chunk_size`
    pub fn new(transfer_id: TransferId, capsule: &TimeCapsule, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size > u32::MAX as usize {
            return Err(NodeError::validation("chunk size out of range"));
        }
        let payload = capsule.to_bytes()?;
        let chunk_hashes = payload.chunks(chunk_size).map(sha256).collect();
        Ok(Self {
            manifest: TransferManifest {
                transfer_id,
                capsule_id: capsule.id(),
                capsule_hash: capsule.proofs.capsule_hash,
                total_size: payload.len() as u64,
                chunk_size: chunk_size as u32,
                chunk_hashes,
            },
            payload,
            acked: 0,
            chunks_sent: 0,
        })
    }

    /// Manifest
    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// Transfer id
    pub fn transfer_id(&self) -> TransferId {
        self.manifest.transfer_id
    }

    /// Chunks acknowledged so far
    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Chunk frames sent across all sessions
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    /// Whether the receiver holds everything
    pub fn is_acknowledged(&self) -> bool {
        self.acked == self.manifest.total_chunks()
    }

    /// Chunk message for `index`
    pub fn chunk(&mut self, index: u32) -> Option<TransferMessage> {
        let size = self.manifest.chunk_size as usize;
        let data = self.payload.chunks(size).nth(index as usize)?.to_vec();
        self.chunks_sent += 1;
        Some(TransferMessage::Chunk {
            transfer_id: self.manifest.transfer_id,
            index,
            hash: self.manifest.chunk_hashes[index as usize],
            data,
        })
    }

    /// Apply a cumulative acknowledgement or resume offer
    pub fn record_ack(&mut self, next_index: u32) -> Result<()> {
        if next_index > self.manifest.total_chunks() {
            return Err(NodeError::validation(format!(
                "ack {next_index} beyond {} chunks",
                self.manifest.total_chunks()
            )));
        }
        self.acked = next_index;
        Ok(())
    }
}

/// Receiver-side transfer state
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    manifest: TransferManifest,
    received: Vec<u8>,
    next_index: u32,
}

impl IncomingTransfer {
    /// Start receiving; rejects inconsistent manifests
    pub fn new(manifest: TransferManifest, max_size: u64) -> Result<Self> {
        if manifest.chunk_size == 0 || manifest.total_size == 0 {
            return Err(NodeError::validation("empty transfer"));
        }
        if manifest.total_size > max_size {
            return Err(NodeError::resource_exceeded(
                "transfer",
                format!("{} bytes exceeds {max_size}", manifest.total_size),
            ));
        }
        let expected = manifest.total_size.div_ceil(u64::from(manifest.chunk_size));
        if manifest.chunk_hashes.len() as u64 != expected {
            return Err(NodeError::validation("chunk hash count does not match size"));
        }
        Ok(Self {
            manifest,
            received: Vec::new(),
            next_index: 0,
        })
    }

    /// Manifest
    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// First chunk not yet held
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Whether every chunk arrived
    pub fn is_complete(&self) -> bool {
        self.next_index == self.manifest.total_chunks()
    }

    /// Accept chunk `index`; duplicates are ignored. Returns the cumulative ack.
    pub fn accept(&mut self, index: u32, data: &[u8], hash: &Digest) -> Result<u32> {
        if index < self.next_index {
            return Ok(self.next_index);
        }
        if index > self.next_index {
            return Err(NodeError::validation(format!(
                "chunk {index} arrived before {}",
                self.next_index
            )));
        }
        let expected = self
            .manifest
            .chunk_hashes
            .get(index as usize)
            .ok_or_else(|| NodeError::validation(format!("chunk {index} beyond manifest")))?;
        if data.len() as u64 != self.manifest.expected_len(index)
            || &sha256(data) != hash
            || hash != expected
        {
            return Err(NodeError::integrity(format!("chunk {index} failed its hash check")));
        }
        self.received.extend_from_slice(data);
        self.next_index += 1;
        Ok(self.next_index)
    }

    /// Reassemble and check the capsule against the manifest
    pub fn finish(&self) -> Result<TimeCapsule> {
        if !self.is_complete() {
            return Err(NodeError::validation("transfer incomplete"));
        }
        let capsule = TimeCapsule::from_bytes(&self.received)?;
        if capsule.id() != self.manifest.capsule_id
            || capsule.proofs.capsule_hash != self.manifest.capsule_hash
            || capsule.compute_hash()? != self.manifest.capsule_hash
        {
            return Err(NodeError::integrity("reassembled capsule does not match manifest"));
        }
        Ok(capsule)
    }
}

/// Outcome reported by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Capsule received intact
    Confirmed,
    /// Some chunks held, transfer interrupted
    Partial,
    /// Capsule failed verification
    Rejected,
}

/// Receiver-signed delivery receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Transfer id
    pub transfer_id: TransferId,
    /// Capsule id
    pub capsule_id: CapsuleId,
    /// Capsule hash the receiver checked
    pub capsule_hash: Digest,
    /// Outcome
    pub status: ReceiptStatus,
    /// Chunks held
    pub chunks_received: u32,
    /// Chunks in the manifest
    pub total_chunks: u32,
    /// Receipt time
    pub received_at_ms: u64,
    /// Receiver identity
    pub receiver: PublicKey,
    /// Signature over everything above
    pub signature: SignatureBytes,
}

#[derive(Serialize)]
struct ReceiptBody<'a> {
    transfer_id: &'a TransferId,
    capsule_id: &'a CapsuleId,
    capsule_hash: &'a Digest,
    status: ReceiptStatus,
    chunks_received: u32,
    total_chunks: u32,
    received_at_ms: u64,
    receiver: &'a PublicKey,
}

impl DeliveryReceipt {
    /// Receipt for `manifest` signed by `signer`
    pub fn sign(
        manifest: &TransferManifest,
        status: ReceiptStatus,
        chunks_received: u32,
        received_at_ms: u64,
        signer: &dyn PeerSigner,
    ) -> Result<Self> {
        let mut receipt = Self {
            transfer_id: manifest.transfer_id,
            capsule_id: manifest.capsule_id,
            capsule_hash: manifest.capsule_hash,
            status,
            chunks_received,
            total_chunks: manifest.total_chunks(),
            received_at_ms,
            receiver: signer.identity()?,
            signature: SignatureBytes([0u8; 64]),
        };
        receipt.signature = signer.sign(&receipt.signing_message()?)?;
        Ok(receipt)
    }

    fn signing_message(&self) -> Result<Vec<u8>> {
        let body = to_canonical_bytes(&ReceiptBody {
            transfer_id: &self.transfer_id,
            capsule_id: &self.capsule_id,
            capsule_hash: &self.capsule_hash,
            status: self.status,
            chunks_received: self.chunks_received,
            total_chunks: self.total_chunks,
            received_at_ms: self.received_at_ms,
            receiver: &self.receiver,
        })?;
        Ok([RECEIPT_DOMAIN, &body].concat())
    }

    /// Check the receipt was signed by `expected` and covers `manifest`
    pub fn verify(&self, expected: &PublicKey, manifest: &TransferManifest) -> Result<()> {
        if &self.receiver != expected {
            return Err(NodeError::integrity("receipt signed by an unexpected key"));
        }
        if self.transfer_id != manifest.transfer_id
            || self.capsule_id != manifest.capsule_id
            || self.capsule_hash != manifest.capsule_hash
        {
            return Err(NodeError::integrity("receipt covers a different transfer"));
        }
        verify_signature(&self.receiver, &self.signing_message()?, &self.signature)
    }
}
