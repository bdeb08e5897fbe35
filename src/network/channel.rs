//! Event Channel
//!
//! Transport-agnostic notification surface between the round coordinator
//! and participants. Both variants honour the same contract:
//!
//! - `open` fires the latched "channel ready" signal at most once, and
//!   participants registered after that still receive `ChannelReady`.
//!   Each participant sees it exactly once.
//! - `expect_recipients` lets the session hold the first round until every
//!   participant is reachable.
//! - Outbound delivery is point-to-point and never blocks.
//! - Inbound notifications carry the sender id and go to the single
//!   installed `InboundHandler`, if any.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::core::signal::Signal;
use crate::game::participant::ParticipantId;
use crate::game::round::{PersonalizedResult, RoundResult};

/// Coordinator to participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundEvent {
    /// The channel is open for play.
    ChannelReady,
    /// Both slots are known.
    PlayersReady {
        /// Recipient's display name.
        self_name: String,
        /// Opponent's display name.
        opponent_name: String,
    },
    /// A round began; submit a move.
    RoundStarted {
        /// 1-based round number.
        round: u32,
        /// Recipient's display name.
        self_name: String,
        /// Opponent's display name.
        opponent_name: String,
    },
    /// The round resolved.
    RoundResult(PersonalizedResult),
    /// The game stopped because of a fault.
    GameAborted {
        /// Short human-readable reason.
        reason: String,
    },
}

impl OutboundEvent {
    /// Result notification as seen by `recipient`.
    pub fn result_for(result: &RoundResult, recipient: ParticipantId) -> Self {
        OutboundEvent::RoundResult(result.personalize(recipient))
    }
}

/// What a participant told the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// Move choice for a round, unparsed.
    MoveSelected {
        /// Round the move is meant for.
        round: u32,
        /// Raw move text.
        choice: String,
    },
    /// Vote after a result.
    ResultConfirmed {
        /// Round being confirmed.
        round: u32,
        /// Continue (true) or stop (false).
        keep_playing: bool,
    },
    /// Acknowledged a game-aborted notification.
    AbortConfirmed,
    /// Transport lost the participant.
    Departed,
}

/// Inbound notification tagged with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Who sent it.
    pub sender: ParticipantId,
    /// What they sent.
    pub kind: InboundKind,
}

impl InboundEvent {
    /// Tag `kind` with `sender`.
    pub fn new(sender: ParticipantId, kind: InboundKind) -> Self {
        Self { sender, kind }
    }
}

/// Receiver of inbound notifications.
///
/// Called from transport tasks; implementations must not block.
pub trait InboundHandler: Send + Sync {
    /// Handle one notification.
    fn on_inbound(&self, event: InboundEvent);
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel was shut down.
    #[error("channel closed")]
    Closed,
    /// Recipient is not (or no longer) reachable.
    #[error("participant {0} is not reachable")]
    RecipientGone(ParticipantId),
    /// Recipient's outbound queue is full.
    #[error("participant {0} is not keeping up")]
    Congested(ParticipantId),
}

/// Single-slot handler registration shared by both variants.
#[derive(Default)]
pub struct InboundHub {
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
}

impl InboundHub {
    /// Install `handler`, replacing any previous one.
    pub fn install(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Remove the handler. Later notifications are dropped.
    pub fn clear(&self) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Is a handler installed.
    pub fn is_installed(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Hand `event` to the handler. Returns false if nobody listens.
    pub fn dispatch(&self, event: InboundEvent) -> bool {
        // Clone out so the handler runs without the lock held.
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                handler.on_inbound(event);
                true
            }
            None => {
                trace!(sender = %event.sender, "Inbound event dropped, no handler");
                false
            }
        }
    }
}

/// Pending waits for participants to become reachable.
///
/// Both methods must be called with the owning channel's membership lock
/// held so an arrival cannot slip between the check and the registration.
#[derive(Default)]
pub struct Arrivals {
    waiting: Mutex<Vec<(BTreeSet<ParticipantId>, Signal)>>,
}

impl Arrivals {
    fn lock(&self) -> MutexGuard<'_, Vec<(BTreeSet<ParticipantId>, Signal)>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal that fires once every id in `expected` is reachable.
    /// `present` reports current membership.
    pub fn expect(
        &self,
        expected: &[ParticipantId],
        present: impl Fn(&ParticipantId) -> bool,
    ) -> Signal {
        let missing: BTreeSet<ParticipantId> =
            expected.iter().copied().filter(|id| !present(id)).collect();
        let signal = Signal::new();
        if missing.is_empty() {
            signal.signal();
        } else {
            self.lock().push((missing, signal.clone()));
        }
        signal
    }

    /// Record that `id` became reachable.
    pub fn arrived(&self, id: ParticipantId) {
        self.lock().retain_mut(|(missing, signal)| {
            missing.remove(&id);
            if missing.is_empty() {
                signal.signal();
                false
            } else {
                true
            }
        });
    }
}

/// The transport seam between coordinator and participants.
pub trait EventChannel: Send + Sync {
    /// Variant name for logs.
    fn kind(&self) -> &'static str;

    /// Send `event` to one participant.
    fn deliver(&self, recipient: ParticipantId, event: OutboundEvent) -> Result<(), ChannelError>;

    /// Latched "channel ready" signal.
    fn ready(&self) -> &Signal;

    /// Inbound handler registration.
    fn inbound(&self) -> &InboundHub;

    /// Participants currently reachable.
    fn recipients(&self) -> Vec<ParticipantId>;

    /// Fire the ready signal and snapshot the participants registered
    /// before it fired, atomically with registration. `None` if it had
    /// already fired.
    fn fire_ready(&self) -> Option<Vec<ParticipantId>>;

    /// Signal that fires once every id in `expected` is reachable.
    fn expect_recipients(&self, expected: &[ParticipantId]) -> Signal;

    /// Fire "channel ready" and tell every participant registered before
    /// it fired; later registrants are told on registration. Returns false
    /// if it had already fired.
    fn open(&self) -> bool {
        let Some(recipients) = self.fire_ready() else {
            return false;
        };
        for id in recipients {
            let _ = self.deliver(id, OutboundEvent::ChannelReady);
        }
        true
    }

    /// Install the inbound handler.
    fn subscribe(&self, handler: Arc<dyn InboundHandler>) {
        self.inbound().install(handler);
    }

    /// Remove the inbound handler.
    fn unsubscribe(&self) {
        self.inbound().clear();
    }
}
