//! Request to receipt: the end-to-end flow driven through a [`Runtime`]
//!
//! ```text
//! receive_request -> evaluate -> accept_offer -> activate_contract
//!   -> preview_plan -> execute_plan -> deliver_capsule
//! ```
//!
//! Every step is gated by the one before it; nothing leaves the device except
//! sealed capsules sent through the network gate.

use crate::connector::{Connector, SyncReport};
use crate::runtime::{Runtime, TransferSlot};
use crate::scheduler::JobKind;
use tracing::{debug, info, warn};
use yachaq_capsule::TimeCapsule;
use yachaq_consent::{
    ActiveContract, ContractDraft, DataRequest, MatchOutcome, RequestStatus, ScopeChoices,
    SingleSignedContract,
};
use yachaq_core::{
    AuditEventType, AuditRecord, CancellationToken, CapsuleId, ContractId, NodeError, RequestId,
    Result, TransferId,
};
use yachaq_crypto::SignatureBytes;
use yachaq_transport::{
    initiate, DeliveryReceipt, FrameLink, GatedLink, OutgoingTransfer, PairwiseSigner,
};
use yachaq_vm::{PlanPreview, QueryPlan, ValidatedPlan, VaultRowSource};

impl Runtime {
    /// Run every inbox check and store the request
    pub fn receive_request(&self, request: DataRequest) -> Result<RequestId> {
        self.ensure_running()?;
        self.inbox.receive(request)
    }

    /// Match a stored request against the local index.
    ///
    /// Anything but an offer closes the request; no reply leaves the device.
    pub fn evaluate(&self, request_id: &RequestId) -> Result<MatchOutcome> {
        self.ensure_running()?;
        let request = self.pending_request(request_id)?;
        self.matcher.observe_load(self.inbox.pending().len());
        let outcome = self.matcher.evaluate(&request, &self.odx)?;
        if !matches!(outcome, MatchOutcome::Eligible(_)) {
            self.inbox.mark_processed(request_id)?;
        }
        Ok(outcome)
    }

    /// The user accepted an offer: draft, narrow and sign the contract.
    ///
    /// The signed contract waits for the requester's countersignature.
    pub fn accept_offer(
        &self,
        request_id: &RequestId,
        choices: ScopeChoices,
    ) -> Result<SingleSignedContract> {
        self.ensure_running()?;
        let request = self.pending_request(request_id)?;
        let signed = ContractDraft::from_request(
            &request,
            choices,
            &self.config.capsule,
            &self.effects,
        )?
        .ds_sign(&self.keyring)?;
        self.inbox.mark_processed(request_id)?;
        self.awaiting_countersign
            .lock()
            .insert(signed.terms.contract_id, signed.clone());
        info!(
            request_id = %request_id,
            contract_id = %signed.terms.contract_id,
            "offer accepted, awaiting countersignature"
        );
        Ok(signed)
    }

    /// The user declined an offer
    pub fn decline_offer(&self, request_id: &RequestId) -> Result<()> {
        self.inbox.reject(request_id, "declined")
    }

    /// Activate a contract this device signed with the requester's signature
    pub fn activate_contract(
        &self,
        contract_id: &ContractId,
        requester_signature: SignatureBytes,
    ) -> Result<ActiveContract> {
        self.ensure_running()?;
        let signed = self
            .awaiting_countersign
            .lock()
            .get(contract_id)
            .cloned()
            .ok_or_else(|| {
                NodeError::not_found(format!("contract {contract_id} is not awaiting signature"))
            })?;
        let active = signed.countersign(requester_signature)?;
        self.contracts.insert(active.clone())?;
        self.awaiting_countersign.lock().remove(contract_id);
        Ok(active)
    }

    /// Revoke an active contract; later plans and deliveries are refused
    pub fn revoke_contract(&self, contract_id: &ContractId, reason: &str) -> Result<()> {
        self.contracts.revoke(contract_id, reason)
    }

    /// Statically validate a plan under its contract and describe it for the
    /// user. No vault object is read.
    pub fn preview_plan(&self, plan: &QueryPlan) -> Result<(ValidatedPlan, PlanPreview)> {
        self.ensure_running()?;
        let contract = self.contracts.require_active(&plan.body.contract_id)?;
        let validated = self.vm.validate(plan, &contract)?;
        let preview = self.vm.preview(&validated);
        Ok((validated, preview))
    }

    /// Run an approved plan and pack its output into a capsule
    pub fn execute_plan(
        &self,
        plan: &ValidatedPlan,
        cancel: &CancellationToken,
    ) -> Result<TimeCapsule> {
        self.ensure_running()?;
        self.scheduler.admit(JobKind::PlanExecution)?;
        let contract = self.contracts.require_active(&plan.contract_id())?;
        let _fence = self.fence.enter(contract.id(), plan.plan_id())?;

        let source = VaultRowSource::new(self.vault.clone(), self.pipeline.clone());
        let output = self.vm.execute(plan, &contract, &source, cancel)?;
        let capsule = self.packager.pack(&output, plan, &contract)?;
        info!(
            plan_id = %plan.plan_id(),
            capsule_id = %capsule.id(),
            "plan executed and packed"
        );
        Ok(capsule)
    }

    /// Deliver a packed capsule to its requester over `link`.
    ///
    /// Frames go through the network gate for `destination`. An interrupted
    /// delivery keeps its acknowledged offset; calling again with a new link
    /// resumes from there.
    pub async fn deliver_capsule<L: FrameLink>(
        &self,
        capsule_id: &CapsuleId,
        link: L,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt> {
        self.ensure_running()?;
        self.scheduler.admit(JobKind::Transfer)?;
        let capsule = self
            .capsules
            .get(capsule_id)
            .ok_or_else(|| NodeError::not_found(format!("capsule {capsule_id}")))?;
        let now = self.effects.now_ms();
        if capsule.is_expired(now) {
            self.audit.record(
                AuditRecord::new(AuditEventType::TtlExpired)
                    .with("capsule_id", capsule_id)
                    .with("stage", "delivery"),
            )?;
            return Err(NodeError::ttl_expired(format!("capsule {capsule_id} expired")));
        }
        let contract = self.contracts.require_active(&capsule.contract_id)?;

        let mut transfer = self.claim_transfer(&capsule)?;
        let gated = GatedLink::new(link, self.gate.clone(), destination);
        let outcome = self
            .send_transfer(&gated, &contract, &mut transfer, cancel)
            .await;

        {
            let mut transfers = self.transfers.lock();
            match &outcome {
                Ok(_) => {
                    transfers.remove(capsule_id);
                }
                Err(e) => {
                    debug!(
                        capsule_id = %capsule_id,
                        acked = transfer.acked(),
                        error = %e,
                        "transfer parked"
                    );
                    transfers.insert(*capsule_id, TransferSlot::Pending(transfer));
                }
            }
        }
        outcome
    }

    /// Acknowledged and total chunks of a parked transfer
    pub fn transfer_progress(&self, capsule_id: &CapsuleId) -> Option<(u32, u32)> {
        match self.transfers.lock().get(capsule_id)? {
            TransferSlot::Pending(t) => Some((t.acked(), t.manifest().total_chunks())),
            TransferSlot::InFlight => None,
        }
    }

    /// Pull everything new from `connector` into the vault and index.
    ///
    /// The cursor is checkpointed after every page, so a failed run resumes
    /// after the last stored page.
    pub async fn sync_connector(&self, connector: &dyn Connector) -> Result<SyncReport> {
        self.ensure_running()?;
        self.scheduler.admit(JobKind::ConnectorSync)?;
        let connector_id = connector.id().to_string();
        let mut report = SyncReport {
            connector_id: connector_id.clone(),
            cursor: self.sync.cursor(&connector_id),
            ..SyncReport::default()
        };

        loop {
            let (batch, attempts) = self.sync.fetch(connector, report.cursor.as_deref()).await?;
            report.attempts += attempts;
            report.pages += 1;
            for item in batch.items {
                let ingested = self.ingest(item)?;
                if !ingested.labeled {
                    report.unlabeled += 1;
                }
                report.stored.push(ingested.raw_ref);
            }
            if batch.next_cursor.is_some() {
                report.cursor = batch.next_cursor;
                self.sync.checkpoint(&connector_id, report.cursor.clone())?;
            }
            if !batch.has_more {
                break;
            }
        }

        self.audit.record(
            AuditRecord::new(AuditEventType::ConnectorSynced)
                .with("connector", &connector_id)
                .with("items", report.stored.len())
                .with("pages", report.pages),
        )?;
        info!(
            connector = %connector_id,
            items = report.stored.len(),
            attempts = report.attempts,
            "connector synced"
        );
        Ok(report)
    }

    fn pending_request(&self, request_id: &RequestId) -> Result<DataRequest> {
        match self.inbox.get(request_id) {
            Some((request, RequestStatus::Pending)) => Ok(request),
            Some((_, status)) => Err(NodeError::validation(format!(
                "request {request_id} is {status:?}"
            ))),
            None => Err(NodeError::not_found(format!("request {request_id}"))),
        }
    }

    fn claim_transfer(&self, capsule: &TimeCapsule) -> Result<OutgoingTransfer> {
        let id = capsule.id();
        let mut transfers = self.transfers.lock();
        let transfer = match transfers.remove(&id) {
            Some(TransferSlot::Pending(transfer)) => transfer,
            Some(TransferSlot::InFlight) => {
                transfers.insert(id, TransferSlot::InFlight);
                return Err(NodeError::deferred(format!(
                    "capsule {id} is already being delivered"
                )));
            }
            None => OutgoingTransfer::new(
                TransferId::generate(&self.effects),
                capsule,
                self.config.transport.chunk_size,
            )?,
        };
        transfers.insert(id, TransferSlot::InFlight);
        Ok(transfer)
    }

    async fn send_transfer(
        &self,
        link: &dyn FrameLink,
        contract: &ActiveContract,
        transfer: &mut OutgoingTransfer,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt> {
        let terms = contract.terms();
        let signer = PairwiseSigner::new(self.keyring.clone(), terms.requester_id.clone());
        let mut session = initiate(
            link,
            &signer,
            &terms.requester_key,
            &self.effects,
            self.config.transport.session_ttl_secs * 1_000,
        )
        .await
        .map_err(|e| {
            warn!(contract_id = %contract.id(), error = %e, "handshake failed");
            e
        })?;
        self.sender.deliver(link, &mut session, transfer, cancel).await
    }
}
