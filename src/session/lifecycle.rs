//! Session Lifecycle
//!
//! Top-level state machine for the one game this process hosts.
//!
//! ```text
//! WaitingForPlayers --threshold reached--> InGame --game end--> GameEnded
//!         |                                   |
//!         +--start timeout--> StartFailed     +--fault--> Failed
//! ```
//!
//! Everything terminal schedules a shutdown. "All disconnected" reschedules
//! the shutdown with a phase-dependent grace but leaves the state alone;
//! once the session is terminal it keeps the pending kind and reason.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::core::signal::{Latch, Signal, WaitError, WaitOutcome};
use crate::game::participant::Participant;
use crate::network::tracker::{ConnectionTracker, TrackerEvent};
use crate::session::shutdown::{ProcessTerminator, ShutdownKind, ShutdownRequest, ShutdownScheduler};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Waiting for the required participants.
    WaitingForPlayers,
    /// Rounds are being played.
    InGame,
    /// Game finished normally.
    GameEnded,
    /// Not enough participants in time.
    StartFailed,
    /// Unrecoverable fault.
    Failed,
}

impl SessionState {
    /// No further transitions except to `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::GameEnded | SessionState::StartFailed | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Captured by the "game ended" latch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEnd {
    /// Why it ended.
    pub reason: String,
    /// Ended by a fault.
    pub failed: bool,
    /// Rounds resolved before the end.
    pub rounds_played: u32,
}

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition not allowed from the current state.
    #[error("invalid transition from {0}")]
    InvalidState(SessionState),
    /// Not enough participants before the start timeout.
    #[error("timed out waiting for players")]
    StartTimedOut,
    /// A wait was cancelled.
    #[error(transparent)]
    Cancelled(#[from] WaitError),
}

/// Session state machine and its latched events.
pub struct SessionLifecycle {
    config: SessionConfig,
    tracker: Arc<ConnectionTracker>,
    shutdown: ShutdownScheduler,
    state: Mutex<SessionState>,
    game_started: Signal,
    start_succeeded: Latch<Vec<Participant>>,
    start_failed: Latch<String>,
    game_ended: Latch<GameEnd>,
}

impl SessionLifecycle {
    /// Lifecycle in `WaitingForPlayers`.
    pub fn new(
        config: SessionConfig,
        tracker: Arc<ConnectionTracker>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        Self {
            config,
            tracker,
            shutdown: ShutdownScheduler::new(terminator),
            state: Mutex::new(SessionState::WaitingForPlayers),
            game_started: Signal::new(),
            start_succeeded: Latch::new(),
            start_failed: Latch::new(),
            game_ended: Latch::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.lock()
    }

    /// Fires when the session enters `InGame`. Shared with the gate.
    pub fn game_started(&self) -> Signal {
        self.game_started.clone()
    }

    /// Latched frozen roster on a successful start.
    pub fn start_succeeded(&self) -> &Latch<Vec<Participant>> {
        &self.start_succeeded
    }

    /// Latched reason on a failed start.
    pub fn start_failed(&self) -> &Latch<String> {
        &self.start_failed
    }

    /// Latched end of game, normal or not.
    pub fn game_ended(&self) -> &Latch<GameEnd> {
        &self.game_ended
    }

    /// Wait (bounded by the start timeout) for the required participants.
    ///
    /// On success the connected snapshot is frozen and returned.
    pub async fn wait_for_players(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Participant>, LifecycleError> {
        let state = self.state();
        if state != SessionState::WaitingForPlayers {
            return Err(LifecycleError::InvalidState(state));
        }
        info!(
            required = self.tracker.required(),
            timeout_ms = self.config.start_timeout.as_millis() as u64,
            "Waiting for players"
        );

        let outcome = self
            .tracker
            .start_ready()
            .wait(Some(self.config.start_timeout), cancel)
            .await?;

        let mut state = self.lock();
        if *state != SessionState::WaitingForPlayers {
            return Err(LifecycleError::InvalidState(*state));
        }
        match outcome {
            WaitOutcome::Signalled => {
                *state = SessionState::InGame;
                self.game_started.signal();
                let snapshot = self.tracker.freeze();
                if snapshot.len() < self.tracker.required() {
                    warn!(connected = snapshot.len(), "Participant left right before start");
                }
                self.start_succeeded.set(snapshot.clone());
                info!(players = snapshot.len(), "Game started");
                Ok(snapshot)
            }
            WaitOutcome::TimedOut => {
                *state = SessionState::StartFailed;
                let reason = "timed out waiting for players".to_string();
                self.start_failed.set(reason.clone());
                drop(state);
                warn!(connected = self.tracker.count(), "Start timed out");
                self.shutdown.schedule(
                    ShutdownKind::StartTimeout,
                    reason,
                    self.config.start_timeout_shutdown_delay,
                );
                Err(LifecycleError::StartTimedOut)
            }
        }
    }

    /// Record a normal end of game.
    pub fn finish_game(&self, reason: impl Into<String>, rounds_played: u32) -> Result<(), LifecycleError> {
        let reason = reason.into();
        {
            let mut state = self.lock();
            if *state != SessionState::InGame {
                return Err(LifecycleError::InvalidState(*state));
            }
            *state = SessionState::GameEnded;
            self.game_ended.set(GameEnd {
                reason: reason.clone(),
                failed: false,
                rounds_played,
            });
        }
        info!(rounds_played, reason = %reason, "Game ended");
        self.shutdown
            .schedule(ShutdownKind::Normal, reason, self.config.normal_shutdown_delay);
        Ok(())
    }

    /// Record an unrecoverable fault from any state.
    pub fn fail(&self, reason: impl Into<String>, rounds_played: u32) {
        let reason = reason.into();
        {
            let mut state = self.lock();
            if *state == SessionState::Failed {
                debug!(reason = %reason, "Already failed");
                return;
            }
            *state = SessionState::Failed;
            if !self.start_succeeded.is_set() {
                self.start_failed.set(reason.clone());
            }
            self.game_ended.set(GameEnd {
                reason: reason.clone(),
                failed: true,
                rounds_played,
            });
        }
        error!(reason = %reason, "Session failed");
        self.shutdown
            .schedule(ShutdownKind::Error, reason, self.config.error_shutdown_delay);
    }

    /// React to a tracker edge.
    pub fn on_tracker_event(&self, event: TrackerEvent) {
        match event {
            TrackerEvent::AllDisconnected => {
                let started = self.game_started.is_signalled();
                let grace = self.config.disconnect_grace(started);
                if self.state().is_terminal() {
                    // The terminal kind decides the exit code; only the delay moves.
                    match self.shutdown.pending() {
                        Some(pending) => {
                            self.shutdown.schedule(pending.kind, pending.reason, grace);
                        }
                        None => debug!("All players disconnected after shutdown fired"),
                    }
                    return;
                }
                self.shutdown.schedule(
                    ShutdownKind::AllPlayersDisconnected,
                    "all players disconnected",
                    grace,
                );
            }
            TrackerEvent::RequiredPlayersReached => {
                if self.state().is_terminal() {
                    return;
                }
                if self.shutdown.pending_kind() == Some(ShutdownKind::AllPlayersDisconnected) {
                    info!("Players returned within grace, keeping session alive");
                    self.shutdown.cancel();
                }
            }
        }
    }

    /// Feed tracker events into `on_tracker_event` until `cancel` fires.
    pub fn spawn_event_watch(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        let mut events = self.tracker.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => lifecycle.on_tracker_event(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Tracker events lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Tracker event watch stopped");
        })
    }

    /// Schedule a shutdown directly, superseding any pending one.
    pub fn schedule_shutdown(&self, kind: ShutdownKind, reason: impl Into<String>, delay: Duration) -> ShutdownRequest {
        self.shutdown.schedule(kind, reason, delay)
    }

    /// Cancel the pending shutdown.
    pub fn cancel_shutdown(&self) -> bool {
        self.shutdown.cancel()
    }

    /// The pending shutdown, if any.
    pub fn pending_shutdown(&self) -> Option<ShutdownRequest> {
        self.shutdown.pending()
    }
}
