//! Request inbox
//!
//! Every inbound request passes, in order: structure, expiry, replay, requester
//! signature, policy stamp and capacity. The first failing check decides the
//! status. Nonces are remembered only for accepted requests and forgotten once the
//! request could no longer be fresh.

use crate::predicate::Predicate;
use crate::request::DataRequest;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use yachaq_core::config::InboxConfig;
use yachaq_core::time::MS_PER_SEC;
use yachaq_core::{
    AuditEventType, AuditRecord, AuditSink, Effects, NodeError, RequestId, Result,
};
use yachaq_crypto::PublicKey;
use yachaq_labels::label::is_valid_label;

/// Outcome of the receive checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceiveStatus {
    /// Stored as pending
    Accepted,
    /// Past expiry, or created in the future
    Expired,
    /// Request id or nonce seen before
    Replay,
    /// Requester signature does not verify
    InvalidSignature,
    /// No policy stamp attached
    MissingStamp,
    /// Stamp does not verify or comes from an untrusted authority
    InvalidStamp,
    /// Structural check failed
    Malformed,
    /// No room left after cleanup
    InboxFull,
}

/// Lifecycle of a stored request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Awaiting matching
    Pending,
    /// Matched (offer or silent drop)
    Processed,
    /// Rejected after acceptance
    Rejected,
}

#[derive(Debug, Clone)]
struct InboxEntry {
    request: DataRequest,
    status: RequestStatus,
}

#[derive(Debug, Default)]
struct InboxState {
    entries: BTreeMap<RequestId, InboxEntry>,
    seen_ids: BTreeMap<RequestId, u64>,
    seen_nonces: BTreeMap<String, u64>,
    counts: BTreeMap<ReceiveStatus, u64>,
}

/// Inbox counters by receive status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxStats {
    /// Receive outcomes so far
    pub outcomes: BTreeMap<ReceiveStatus, u64>,
    /// Requests still pending
    pub pending: usize,
}

/// Validates and stores inbound signed requests
pub struct RequestInbox {
    config: InboxConfig,
    trusted_authorities: BTreeSet<PublicKey>,
    state: Mutex<InboxState>,
    audit: Arc<dyn AuditSink>,
    effects: Effects,
}

impl RequestInbox {
    /// Empty inbox trusting the given policy authorities
    pub fn new(
        config: InboxConfig,
        trusted_authorities: impl IntoIterator<Item = PublicKey>,
        audit: Arc<dyn AuditSink>,
        effects: Effects,
    ) -> Self {
        Self {
            config,
            trusted_authorities: trusted_authorities.into_iter().collect(),
            state: Mutex::new(InboxState::default()),
            audit,
            effects,
        }
    }

    /// Run every check and store the request as pending
    pub fn receive(&self, request: DataRequest) -> Result<RequestId> {
        let now = self.effects.now_ms();
        let mut state = self.state.lock();
        let id = request.id();

        let outcome = self.check(&mut state, &request, now);
        let status = match &outcome {
            Ok(()) => ReceiveStatus::Accepted,
            Err((status, _)) => *status,
        };
        *state.counts.entry(status).or_default() += 1;

        match outcome {
            Ok(()) => {
                state.seen_ids.insert(id, request.body.expires_at_ms);
                state
                    .seen_nonces
                    .insert(request.body.nonce.clone(), request.body.expires_at_ms);
                state.entries.insert(
                    id,
                    InboxEntry {
                        request,
                        status: RequestStatus::Pending,
                    },
                );
                drop(state);
                info!(request_id = %id, "request accepted");
                self.audit.append(
                    AuditRecord::new(AuditEventType::RequestReceived).with("request_id", id),
                )?;
                Ok(id)
            }
            Err((status, error)) => {
                drop(state);
                warn!(request_id = %id, ?status, "request rejected");
                let event = match status {
                    ReceiveStatus::Expired | ReceiveStatus::Replay => {
                        AuditEventType::ReplayDetected
                    }
                    _ => AuditEventType::RequestRejected,
                };
                self.audit.append(
                    AuditRecord::new(event)
                        .with("request_id", id)
                        .with("status", format!("{status:?}")),
                )?;
                Err(error)
            }
        }
    }

    fn check(
        &self,
        state: &mut InboxState,
        request: &DataRequest,
        now: u64,
    ) -> std::result::Result<(), (ReceiveStatus, NodeError)> {
        self.check_structure(request)
            .map_err(|e| (ReceiveStatus::Malformed, e))?;

        let body = &request.body;
        let skew = self.config.clock_skew_secs * MS_PER_SEC;
        if body.created_at_ms > now + skew || now >= body.expires_at_ms + skew {
            return Err((
                ReceiveStatus::Expired,
                NodeError::replay(format!("request {} is not fresh", body.request_id)),
            ));
        }

        prune(state, now.saturating_sub(skew));
        if state.seen_ids.contains_key(&body.request_id)
            || state.seen_nonces.contains_key(&body.nonce)
        {
            return Err((
                ReceiveStatus::Replay,
                NodeError::replay(format!("request {} replayed", body.request_id)),
            ));
        }

        request
            .verify_signature()
            .map_err(|e| (ReceiveStatus::InvalidSignature, e))?;

        let stamp = request.policy_stamp.as_ref().ok_or_else(|| {
            (
                ReceiveStatus::MissingStamp,
                NodeError::validation("request carries no policy stamp"),
            )
        })?;
        if !self.trusted_authorities.contains(&stamp.authority) {
            return Err((
                ReceiveStatus::InvalidStamp,
                NodeError::integrity("policy stamp from untrusted authority"),
            ));
        }
        stamp
            .verify(body)
            .map_err(|e| (ReceiveStatus::InvalidStamp, e))?;

        if pending_count(state) >= self.config.capacity {
            let freed = remove_expired(state, now);
            debug!(freed, "inbox cleanup before capacity check");
            if pending_count(state) >= self.config.capacity {
                return Err((
                    ReceiveStatus::InboxFull,
                    NodeError::resource_exceeded("inbox", "inbox at capacity"),
                ));
            }
        }
        Ok(())
    }

    fn check_structure(&self, request: &DataRequest) -> Result<()> {
        let body = &request.body;
        Predicate::parse(&body.eligibility_predicate, self.config.max_predicate_len)?;
        if body.expires_at_ms <= body.created_at_ms {
            return Err(NodeError::validation("request expires before creation"));
        }
        if body.expires_at_ms - body.created_at_ms > self.config.max_request_ttl_secs * MS_PER_SEC
        {
            return Err(NodeError::validation("request TTL exceeds maximum"));
        }
        let nonce_ok = body.nonce.len() >= 16
            && body.nonce.len() <= 128
            && body.nonce.chars().all(|c| c.is_ascii_hexdigit());
        if !nonce_ok {
            return Err(NodeError::validation("malformed nonce"));
        }
        if body.k_min == 0 {
            return Err(NodeError::validation("k_min must be positive"));
        }
        let labels = body
            .scope
            .required_labels
            .iter()
            .chain(&body.scope.optional_labels);
        for label in labels {
            if !is_valid_label(label) {
                return Err(NodeError::validation(format!("invalid label {label}")));
            }
        }
        if body.scope.required_labels.is_empty() {
            return Err(NodeError::validation("request names no required labels"));
        }
        if body.scope.record_types.is_empty() {
            return Err(NodeError::validation("request names no record types"));
        }
        Ok(())
    }

    /// Mark a pending request as processed
    pub fn mark_processed(&self, id: &RequestId) -> Result<()> {
        self.set_status(id, RequestStatus::Processed)
    }

    /// Reject a stored request
    pub fn reject(&self, id: &RequestId, reason: &str) -> Result<()> {
        self.set_status(id, RequestStatus::Rejected)?;
        self.audit.append(
            AuditRecord::new(AuditEventType::RequestRejected)
                .with("request_id", id)
                .with("reason", reason),
        )
    }

    fn set_status(&self, id: &RequestId, status: RequestStatus) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| NodeError::not_found(format!("request {id} not in inbox")))?;
        entry.status = status;
        Ok(())
    }

    /// Pending, unexpired requests in id order
    pub fn pending(&self) -> Vec<DataRequest> {
        let now = self.effects.now_ms();
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.status == RequestStatus::Pending && !e.request.is_expired(now))
            .map(|e| e.request.clone())
            .collect()
    }

    /// Look up a stored request
    pub fn get(&self, id: &RequestId) -> Option<(DataRequest, RequestStatus)> {
        self.state
            .lock()
            .entries
            .get(id)
            .map(|e| (e.request.clone(), e.status))
    }

    /// Drop expired requests and stale replay records; returns requests dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = self.effects.now_ms();
        let mut state = self.state.lock();
        let removed = remove_expired(&mut state, now);
        prune(&mut state, now.saturating_sub(self.config.clock_skew_secs * MS_PER_SEC));
        removed
    }

    /// Counters
    pub fn stats(&self) -> InboxStats {
        let state = self.state.lock();
        InboxStats {
            outcomes: state.counts.clone(),
            pending: pending_count(&state),
        }
    }
}

fn pending_count(state: &InboxState) -> usize {
    state
        .entries
        .values()
        .filter(|e| e.status == RequestStatus::Pending)
        .count()
}

fn remove_expired(state: &mut InboxState, now: u64) -> usize {
    let before = state.entries.len();
    state.entries.retain(|_, e| !e.request.is_expired(now));
    before - state.entries.len()
}

/// Forget replay records whose request expired before `cutoff`; such a request
/// can no longer pass the expiry check.
fn prune(state: &mut InboxState, cutoff: u64) {
    state.seen_ids.retain(|_, expires| *expires > cutoff);
    state.seen_nonces.retain(|_, expires| *expires > cutoff);
}

impl std::fmt::Debug for RequestInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInbox")
            .field("capacity", &self.config.capacity)
            .field("trusted_authorities", &self.trusted_authorities.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::fixtures::body;
    use crate::request::PolicyStamp;
    use assert_matches::assert_matches;
    use yachaq_audit::AuditLog;
    use yachaq_core::ManualClock;
    use yachaq_crypto::SigningIdentity;

    const T0: u64 = 1_772_447_400_000;

    struct Harness {
        effects: Effects,
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        requester: SigningIdentity,
        authority: SigningIdentity,
        inbox: RequestInbox,
    }

    fn harness(capacity: usize) -> Harness {
        let (effects, clock) = Effects::deterministic(11, T0);
        let audit = Arc::new(AuditLog::in_memory(effects.clone()));
        let requester = SigningIdentity::generate(&effects);
        let authority = SigningIdentity::generate(&effects);
        let config = InboxConfig {
            capacity,
            ..InboxConfig::default()
        };
        let inbox = RequestInbox::new(
            config,
            [authority.public_key()],
            audit.clone(),
            effects.clone(),
        );
        Harness {
            effects,
            clock,
            audit,
            requester,
            authority,
            inbox,
        }
    }

    impl Harness {
        fn request(&self) -> DataRequest {
            let body = body(&self.effects, &self.requester, "mobility.trip_count > 10");
            let stamp = PolicyStamp::issue(&self.authority, &body, T0).unwrap();
            DataRequest::sign(body, &self.requester).unwrap().with_stamp(stamp)
        }

        fn audit_types(&self) -> Vec<AuditEventType> {
            self.audit.export().unwrap().event_types()
        }
    }

    #[test]
    fn test_accepts_valid_request() {
        let h = harness(10);
        let request = h.request();
        let id = h.inbox.receive(request).unwrap();
        assert_eq!(h.inbox.pending().len(), 1);
        assert_eq!(h.inbox.get(&id).unwrap().1, RequestStatus::Pending);
        assert_eq!(h.audit_types(), vec![AuditEventType::RequestReceived]);
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let h = harness(10);
        let first = h.request();
        h.inbox.receive(first.clone()).unwrap();
        assert_matches!(h.inbox.receive(first.clone()), Err(NodeError::ReplayDetected { .. }));

        // same nonce under a fresh id and signature
        let mut body = body(&h.effects, &h.requester, "has(mobility.trip)");
        body.nonce = first.body.nonce.clone();
        let stamp = PolicyStamp::issue(&h.authority, &body, T0).unwrap();
        let again = DataRequest::sign(body, &h.requester).unwrap().with_stamp(stamp);
        assert_matches!(h.inbox.receive(again), Err(NodeError::ReplayDetected { .. }));
        assert_eq!(h.inbox.stats().outcomes[&ReceiveStatus::Replay], 2);
        assert_eq!(h.inbox.pending().len(), 1);
    }

    #[test]
    fn test_expired_request_rejected_and_audited() {
        let h = harness(10);
        let request = h.request();
        h.clock.advance_ms(2 * 3_600_000);
        assert_matches!(h.inbox.receive(request), Err(NodeError::ReplayDetected { .. }));
        assert_eq!(h.audit_types(), vec![AuditEventType::ReplayDetected]);
        assert!(h.inbox.pending().is_empty());
    }

    #[test]
    fn test_future_request_treated_as_stale() {
        let h = harness(10);
        let mut body = body(&h.effects, &h.requester, "has(mobility.trip)");
        body.created_at_ms += 10 * 60_000;
        body.expires_at_ms += 10 * 60_000;
        let stamp = PolicyStamp::issue(&h.authority, &body, T0).unwrap();
        let request = DataRequest::sign(body, &h.requester).unwrap().with_stamp(stamp);
        assert_matches!(h.inbox.receive(request), Err(NodeError::ReplayDetected { .. }));
    }

    #[test]
    fn test_signature_and_stamp_checks() {
        let h = harness(10);
        let mut tampered = h.request();
        tampered.body.compensation.amount_cents = 1;
        assert_matches!(h.inbox.receive(tampered), Err(NodeError::IntegrityFailure { .. }));

        let mut unstamped = h.request();
        unstamped.policy_stamp = None;
        assert_matches!(h.inbox.receive(unstamped), Err(NodeError::Validation { .. }));

        let rogue = SigningIdentity::generate(&h.effects);
        let body = body(&h.effects, &h.requester, "has(mobility.trip)");
        let stamp = PolicyStamp::issue(&rogue, &body, T0).unwrap();
        let request = DataRequest::sign(body, &h.requester).unwrap().with_stamp(stamp);
        assert_matches!(h.inbox.receive(request), Err(NodeError::IntegrityFailure { .. }));

        let stats = h.inbox.stats();
        assert_eq!(stats.outcomes[&ReceiveStatus::InvalidSignature], 1);
        assert_eq!(stats.outcomes[&ReceiveStatus::MissingStamp], 1);
        assert_eq!(stats.outcomes[&ReceiveStatus::InvalidStamp], 1);
        assert!(h
            .audit_types()
            .iter()
            .all(|t| *t == AuditEventType::RequestRejected));
    }

    #[test]
    fn test_malformed_predicate_rejected() {
        let h = harness(10);
        let body = body(&h.effects, &h.requester, "EXEC(anything)");
        let stamp = PolicyStamp::issue(&h.authority, &body, T0).unwrap();
        let request = DataRequest::sign(body, &h.requester).unwrap().with_stamp(stamp);
        assert_matches!(h.inbox.receive(request), Err(NodeError::Validation { .. }));
        assert_eq!(h.inbox.stats().outcomes[&ReceiveStatus::Malformed], 1);
    }

    #[test]
    fn test_capacity_frees_expired_first() {
        let h = harness(1);
        h.inbox.receive(h.request()).unwrap();
        assert_matches!(
            h.inbox.receive(h.request()),
            Err(NodeError::ResourceExceeded { .. })
        );
        h.clock.advance_ms(3_600_000 + 1);
        // the first request is now expired and gets cleaned up
        h.inbox.receive(h.request()).unwrap();
        assert_eq!(h.inbox.pending().len(), 1);
    }

    #[test]
    fn test_processed_requests_leave_pending() {
        let h = harness(10);
        let a = h.inbox.receive(h.request()).unwrap();
        let b = h.inbox.receive(h.request()).unwrap();
        h.inbox.mark_processed(&a).unwrap();
        h.inbox.reject(&b, "scope too broad").unwrap();
        assert!(h.inbox.pending().is_empty());
        assert_matches!(
            h.inbox.mark_processed(&RequestId::generate(&h.effects)),
            Err(NodeError::NotFound { .. })
        );
    }
}
