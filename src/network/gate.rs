//! Connection Gate
//!
//! Every connection attempt passes through here before it is approved.
//!
//! ```text
//! attempt -> game started?  -> reject
//!         -> validator      -> reject(reason)
//!         -> tracker        -> reject(full / duplicate)
//!         -> ready?         -> approve
//!                              else pending, queued in arrival order
//! ready flips true          -> release queue front to back, approving all
//! ```
//!
//! A rejected attempt never touches the tracker.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::core::signal::Signal;
use crate::game::participant::{Participant, ParticipantId};
use crate::network::auth::{AuthError, ConnectionValidator};
use crate::network::tracker::{ConnectionTracker, TrackerError};

/// Why an attempt was turned away.
#[derive(Debug, Error)]
pub enum GateError {
    /// The game is already running.
    #[error("game already started")]
    GameStarted,
    /// Id falls in the synthetic range.
    #[error("participant id {0} is reserved")]
    ReservedId(ParticipantId),
    /// Validator refused the identity.
    #[error(transparent)]
    Invalid(#[from] AuthError),
    /// Capacity or duplicate check failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// Participant left while waiting for approval.
    #[error("disconnected before approval")]
    Departed,
    /// The session is tearing down.
    #[error("{0}")]
    Closing(String),
}

/// An incoming connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Transport-assigned id.
    pub participant_id: ParticipantId,
    /// Identity payload (name, token, ...).
    pub payload: BTreeMap<String, String>,
}

impl ConnectionRequest {
    /// Build a request from payload entries.
    pub fn new(
        participant_id: ParticipantId,
        payload: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            participant_id,
            payload: payload.into_iter().collect(),
        }
    }
}

/// Decision for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    /// Who asked.
    pub participant_id: ParticipantId,
    /// Final approval.
    pub approved: bool,
    /// Decision deferred until gameplay is ready.
    pub pending: bool,
    /// Rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Display name the participant will be shown under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ConnectionResponse {
    fn approved(participant: &Participant) -> Self {
        Self {
            participant_id: participant.id,
            approved: true,
            pending: false,
            reason: None,
            display_name: Some(participant.name.clone()),
        }
    }

    fn pending(participant: &Participant) -> Self {
        Self {
            approved: false,
            pending: true,
            ..Self::approved(participant)
        }
    }

    fn rejected(participant_id: ParticipantId, error: &GateError) -> Self {
        Self {
            participant_id,
            approved: false,
            pending: false,
            reason: Some(error.to_string()),
            display_name: None,
        }
    }
}

/// Result of `ConnectionGate::admit`.
#[derive(Debug)]
pub struct Admission {
    /// Immediate answer. Pending answers resolve through `deferred`.
    pub response: ConnectionResponse,
    /// Final answer for pending admissions.
    pub deferred: Option<oneshot::Receiver<ConnectionResponse>>,
}

impl Admission {
    /// Wait for the final decision.
    pub async fn finalize(self) -> ConnectionResponse {
        let Some(rx) = self.deferred else {
            return self.response;
        };
        let participant_id = self.response.participant_id;
        rx.await.unwrap_or_else(|_| {
            ConnectionResponse::rejected(
                participant_id,
                &GateError::Closing("session closed".to_string()),
            )
        })
    }
}

struct PendingApproval {
    participant: Participant,
    reply: oneshot::Sender<ConnectionResponse>,
}

#[derive(Default)]
struct GateState {
    queue: VecDeque<PendingApproval>,
    closed: Option<String>,
}

type Readiness = Box<dyn Fn() -> bool + Send + Sync>;

/// Admission control in front of the tracker.
pub struct ConnectionGate {
    tracker: Arc<ConnectionTracker>,
    validator: Arc<dyn ConnectionValidator>,
    game_started: Signal,
    gameplay_ready: Signal,
    readiness: Readiness,
    state: Mutex<GateState>,
}

impl ConnectionGate {
    /// Create a gate. `game_started` is fired by the session when play begins.
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        validator: Arc<dyn ConnectionValidator>,
        game_started: Signal,
    ) -> Self {
        let gameplay_ready = Signal::new();
        let flag = gameplay_ready.clone();
        Self {
            tracker,
            validator,
            game_started,
            gameplay_ready,
            readiness: Box::new(move || flag.is_signalled()),
            state: Mutex::new(GateState::default()),
        }
    }

    /// Replace the default "gameplay ready" predicate.
    ///
    /// The predicate runs under the gate lock and must not call back into
    /// the gate. Call `release_if_ready` whenever its answer may change.
    pub fn with_readiness(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.readiness = Box::new(predicate);
        self
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one connection attempt through the gate.
    pub fn admit(&self, request: ConnectionRequest) -> Admission {
        let id = request.participant_id;
        match self.try_admit(request) {
            Ok(admission) => admission,
            Err(error) => {
                info!(participant = %id, reason = %error, "Connection rejected");
                Admission {
                    response: ConnectionResponse::rejected(id, &error),
                    deferred: None,
                }
            }
        }
    }

    fn try_admit(&self, request: ConnectionRequest) -> Result<Admission, GateError> {
        if self.game_started.is_signalled() {
            return Err(GateError::GameStarted);
        }
        if request.participant_id.is_synthetic() {
            return Err(GateError::ReservedId(request.participant_id));
        }
        let identity = self.validator.validate(&request)?;
        let participant = Participant::new(request.participant_id, identity.display_name);

        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(GateError::Closing(reason.clone()));
        }
        self.tracker.register(participant.clone())?;

        if (self.readiness)() {
            info!(participant = %participant.id, name = %participant.name, "Connection approved");
            return Ok(Admission {
                response: ConnectionResponse::approved(&participant),
                deferred: None,
            });
        }

        let (reply, rx) = oneshot::channel();
        let response = ConnectionResponse::pending(&participant);
        debug!(participant = %participant.id, queued = state.queue.len() + 1, "Connection pending");
        state.queue.push_back(PendingApproval { participant, reply });
        Ok(Admission {
            response,
            deferred: Some(rx),
        })
    }

    /// Mark gameplay ready and release the queue.
    pub fn mark_gameplay_ready(&self) -> usize {
        self.gameplay_ready.signal();
        self.release_if_ready()
    }

    /// Re-evaluate readiness; if true, approve every queued attempt in
    /// arrival order. Returns how many were released.
    pub fn release_if_ready(&self) -> usize {
        let mut state = self.lock();
        if state.closed.is_some() || !(self.readiness)() {
            return 0;
        }
        let released = state.queue.len();
        for pending in state.queue.drain(..) {
            info!(participant = %pending.participant.id, "Pending connection approved");
            // Receiver gone means the transport dropped the socket; the
            // disconnect path cleans the tracker.
            let _ = pending
                .reply
                .send(ConnectionResponse::approved(&pending.participant));
        }
        released
    }

    /// Transport reported a disconnect. Returns true if it was tracked.
    pub fn on_disconnect(&self, id: ParticipantId) -> bool {
        let mut state = self.lock();
        if let Some(pos) = state.queue.iter().position(|p| p.participant.id == id) {
            if let Some(pending) = state.queue.remove(pos) {
                debug!(participant = %id, "Dropped pending approval");
                let _ = pending
                    .reply
                    .send(ConnectionResponse::rejected(id, &GateError::Departed));
            }
        }
        self.tracker.remove(id)
    }

    /// Refuse everything from now on and answer queued attempts with a
    /// rejection. Returns how many were refused.
    pub fn close(&self, reason: &str) -> usize {
        let mut state = self.lock();
        state.closed = Some(reason.to_string());
        let error = GateError::Closing(reason.to_string());
        let refused = state.queue.len();
        for pending in state.queue.drain(..) {
            let _ = pending
                .reply
                .send(ConnectionResponse::rejected(pending.participant.id, &error));
        }
        if refused > 0 {
            warn!(refused, reason, "Released pending approvals without granting");
        }
        refused
    }

    /// Attempts waiting for readiness.
    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Shared tracker.
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::OpenValidator;
    use proptest::prelude::*;

    fn gate(required: usize) -> (ConnectionGate, Signal) {
        let started = Signal::new();
        let gate = ConnectionGate::new(
            Arc::new(ConnectionTracker::new(required)),
            Arc::new(OpenValidator),
            started.clone(),
        );
        (gate, started)
    }

    fn request(id: u64, name: &str) -> ConnectionRequest {
        ConnectionRequest::new(
            ParticipantId(id),
            [("name".to_string(), name.to_string())],
        )
    }

    #[test]
    fn test_approves_immediately_when_ready() {
        let (gate, _) = gate(2);
        gate.mark_gameplay_ready();
        let admission = gate.admit(request(1, "ana"));
        assert!(admission.response.approved);
        assert!(!admission.response.pending);
        assert!(admission.deferred.is_none());
        assert_eq!(admission.response.display_name.as_deref(), Some("ana"));
    }

    #[test]
    fn test_rejection_leaves_tracker_untouched() {
        let (gate, started) = gate(2);
        gate.mark_gameplay_ready();

        let invalid = gate.admit(ConnectionRequest::new(ParticipantId(1), std::iter::empty()));
        assert!(!invalid.response.approved);
        assert!(invalid.response.reason.is_some());
        assert_eq!(gate.tracker().count(), 0);

        let reserved = gate.admit(request(ParticipantId::synthetic(0).get(), "bot"));
        assert!(!reserved.response.approved);
        assert_eq!(gate.tracker().count(), 0);

        started.signal();
        let late = gate.admit(request(2, "ben"));
        assert_eq!(late.response.reason.as_deref(), Some("game already started"));
        assert_eq!(gate.tracker().count(), 0);
    }

    #[tokio::test]
    async fn test_pending_release_in_arrival_order() {
        let (gate, _) = gate(2);
        let first = gate.admit(request(7, "ana"));
        let second = gate.admit(request(3, "ben"));
        assert!(first.response.pending && second.response.pending);
        assert_eq!(gate.pending_count(), 2);
        assert_eq!(gate.tracker().count(), 2);

        assert_eq!(gate.mark_gameplay_ready(), 2);
        let first = first.finalize().await;
        let second = second.finalize().await;
        assert!(first.approved && second.approved);

        let order: Vec<_> = gate.tracker().snapshot().iter().map(|p| p.id).collect();
        assert_eq!(order, vec![ParticipantId(7), ParticipantId(3)]);
    }

    #[tokio::test]
    async fn test_custom_readiness_predicate() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let flag = Arc::new(AtomicBool::new(false));
        let probe = flag.clone();
        let (gate, _) = gate(1);
        let gate = gate.with_readiness(move || probe.load(Ordering::SeqCst));

        let admission = gate.admit(request(1, "ana"));
        assert!(admission.response.pending);
        assert_eq!(gate.release_if_ready(), 0);

        flag.store(true, Ordering::SeqCst);
        assert_eq!(gate.release_if_ready(), 1);
        assert!(admission.finalize().await.approved);
    }

    #[tokio::test]
    async fn test_disconnect_drops_pending_approval() {
        let (gate, _) = gate(2);
        let admission = gate.admit(request(1, "ana"));
        assert!(gate.on_disconnect(ParticipantId(1)));
        assert_eq!(gate.pending_count(), 0);
        assert_eq!(gate.tracker().count(), 0);

        let response = admission.finalize().await;
        assert!(!response.approved);
        assert_eq!(response.reason.as_deref(), Some("disconnected before approval"));
    }

    #[tokio::test]
    async fn test_close_refuses_queued_and_future() {
        let (gate, _) = gate(2);
        let admission = gate.admit(request(1, "ana"));
        assert_eq!(gate.close("shutting down"), 1);
        assert!(!admission.finalize().await.approved);

        gate.mark_gameplay_ready();
        assert!(!gate.admit(request(2, "ben")).response.approved);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect { valid: bool },
        Disconnect(usize),
        Ready,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<bool>().prop_map(|valid| Op::Connect { valid }),
            1 => (0usize..8).prop_map(Op::Disconnect),
            1 => Just(Op::Ready),
        ]
    }

    fn settle(admissions: &mut Vec<Admission>) -> usize {
        let mut approved = 0;
        for admission in admissions.iter_mut() {
            if admission.response.approved {
                approved += 1;
            } else if let Some(rx) = admission.deferred.as_mut() {
                if let Ok(response) = rx.try_recv() {
                    admission.response = response;
                    admission.deferred = None;
                    approved += usize::from(admission.response.approved);
                }
            }
        }
        approved
    }

    proptest! {
        #[test]
        fn prop_never_over_admits(
            required in 1usize..=2,
            ready_at in proptest::option::of(0usize..10),
            attempts in proptest::collection::vec(any::<bool>(), 0..10),
        ) {
            let (gate, _) = gate(required);
            let mut admissions = Vec::new();
            for (i, valid) in attempts.iter().enumerate() {
                if ready_at == Some(i) {
                    gate.mark_gameplay_ready();
                }
                let name = if *valid { "player" } else { "" };
                admissions.push(gate.admit(request(i as u64 + 1, name)));
            }
            gate.mark_gameplay_ready();
            prop_assert!(settle(&mut admissions) <= required);
        }

        #[test]
        fn prop_tracked_never_exceeds_required(
            required in 1usize..=2,
            ops in proptest::collection::vec(op(), 0..32),
        ) {
            let (gate, _) = gate(required);
            let mut next_id = 1u64;
            for op in ops {
                match op {
                    Op::Connect { valid } => {
                        let name = if valid { "player" } else { "" };
                        let _ = gate.admit(request(next_id, name));
                        next_id += 1;
                    }
                    Op::Disconnect(offset) => {
                        let id = next_id.saturating_sub(offset as u64 + 1);
                        gate.on_disconnect(ParticipantId(id));
                    }
                    Op::Ready => {
                        gate.mark_gameplay_ready();
                    }
                }
                prop_assert!(gate.tracker().count() <= required);
                prop_assert!(gate.pending_count() <= gate.tracker().count());
            }
        }
    }
}
