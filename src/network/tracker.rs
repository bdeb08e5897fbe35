//! Connection Tracking
//!
//! Connected participants in connection order, against a required-count
//! threshold. Emits edge-triggered events once per epoch; an epoch ends when
//! the last participant leaves.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::signal::Signal;
use crate::game::participant::{Participant, ParticipantId};

/// Edge events emitted by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Count crossed up to the threshold (once per epoch).
    RequiredPlayersReached,
    /// Count returned to zero after being non-zero.
    AllDisconnected,
}

/// Tracker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Threshold changes are frozen once the game started.
    #[error("required player count is frozen at {0}")]
    Frozen(usize),
    /// Every slot is taken.
    #[error("session is full")]
    Full,
    /// Id already tracked.
    #[error("participant {0} already connected")]
    AlreadyConnected(ParticipantId),
}

struct TrackerState {
    connected: Vec<Participant>,
    required: usize,
    frozen: bool,
    reached_this_epoch: bool,
    epoch: u64,
}

/// Connected-participant set with a readiness threshold.
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
    events: broadcast::Sender<TrackerEvent>,
    /// Fires the first time the threshold is reached; never resets.
    start_ready: Signal,
}

impl ConnectionTracker {
    /// Create a tracker requiring `required` participants.
    pub fn new(required: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(TrackerState {
                connected: Vec::new(),
                required,
                frozen: false,
                reached_this_epoch: false,
                epoch: 0,
            }),
            events,
            start_ready: Signal::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the threshold. Idempotent before `freeze`; rejected afterwards
    /// unless unchanged.
    pub fn set_required(&self, required: usize) -> Result<(), TrackerError> {
        let mut state = self.lock();
        if state.required == required {
            return Ok(());
        }
        if state.frozen {
            return Err(TrackerError::Frozen(state.required));
        }
        state.required = required;
        debug!(required, "Required player count updated");
        self.check_reached(&mut state);
        Ok(())
    }

    /// Current threshold.
    pub fn required(&self) -> usize {
        self.lock().required
    }

    /// Lock the threshold and return the connected snapshot.
    pub fn freeze(&self) -> Vec<Participant> {
        let mut state = self.lock();
        state.frozen = true;
        state.connected.clone()
    }

    /// Add a participant, atomically with the capacity check.
    pub fn register(&self, participant: Participant) -> Result<usize, TrackerError> {
        let mut state = self.lock();
        if state.connected.iter().any(|p| p.id == participant.id) {
            return Err(TrackerError::AlreadyConnected(participant.id));
        }
        if state.connected.len() >= state.required {
            return Err(TrackerError::Full);
        }
        info!(participant = %participant.id, name = %participant.name, "Participant registered");
        state.connected.push(participant);
        self.check_reached(&mut state);
        Ok(state.connected.len())
    }

    /// Remove a participant. Returns false if it was not tracked.
    pub fn remove(&self, id: ParticipantId) -> bool {
        let mut state = self.lock();
        let before = state.connected.len();
        state.connected.retain(|p| p.id != id);
        if state.connected.len() == before {
            return false;
        }
        info!(participant = %id, remaining = state.connected.len(), "Participant removed");

        if state.connected.is_empty() {
            state.epoch += 1;
            state.reached_this_epoch = false;
            let _ = self.events.send(TrackerEvent::AllDisconnected);
        }
        true
    }

    fn check_reached(&self, state: &mut TrackerState) {
        if state.reached_this_epoch || state.connected.len() < state.required {
            return;
        }
        state.reached_this_epoch = true;
        info!(count = state.connected.len(), epoch = state.epoch, "Required players reached");
        self.start_ready.signal();
        let _ = self.events.send(TrackerEvent::RequiredPlayersReached);
    }

    /// Connected participants in connection order.
    pub fn snapshot(&self) -> Vec<Participant> {
        self.lock().connected.clone()
    }

    /// Number connected.
    pub fn count(&self) -> usize {
        self.lock().connected.len()
    }

    /// Is `id` connected.
    pub fn contains(&self, id: ParticipantId) -> bool {
        self.lock().connected.iter().any(|p| p.id == id)
    }

    /// Signal that fires the first time the threshold is reached.
    pub fn start_ready(&self) -> &Signal {
        &self.start_ready
    }

    /// Subscribe to edge events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }
}
