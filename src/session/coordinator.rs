//! Round Coordinator
//!
//! Drives rounds over an `EventChannel` until someone stops.
//!
//! ```text
//! per round:
//!   slots (connection order, synthetic fill)
//!   -> RoundStarted to humans
//!   -> synthetic moves, then wait for human moves (bounded), back-fill
//!   -> resolve, RoundResult to humans
//!   -> wait for votes (bounded): all continue -> next round, else stop
//! ```
//!
//! Inbound notifications land in a single `Inbox` whose per-round state is
//! replaced at the start of every round. Departures are sticky across
//! rounds: a departed participant is back-filled and counts as a quit vote.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::core::rng::DeterministicRng;
use crate::core::signal::{Signal, WaitError, WaitOutcome};
use crate::game::moves::Move;
use crate::game::participant::{Participant, ParticipantId, RoundSlots};
use crate::game::round::{
    ConfirmationTally, RoundResult, RoundSubmission, SubmissionError, TallyVerdict,
};
use crate::network::channel::{EventChannel, InboundEvent, InboundHandler, InboundKind, OutboundEvent};

/// Coordinator faults.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A wait was cancelled by session teardown.
    #[error(transparent)]
    Cancelled(#[from] WaitError),
    /// Resolution was attempted on an incomplete round.
    #[error("round {round} could not be resolved: {source}")]
    Resolution {
        /// Round number.
        round: u32,
        /// Underlying error.
        source: SubmissionError,
    },
}

/// Why the game stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// A participant voted to stop.
    Quit(ParticipantId),
    /// A participant left.
    Departed(ParticipantId),
    /// Not every vote arrived in time.
    ConfirmationTimeout,
    /// The round limit was reached.
    RoundLimit,
    /// Only synthetic participants; a single round is played.
    NoHumans,
}

impl EndReason {
    /// Short description for logs and shutdown reasons.
    pub fn describe(self) -> String {
        match self {
            EndReason::Quit(id) => format!("{id} chose to stop"),
            EndReason::Departed(id) => format!("{id} left the game"),
            EndReason::ConfirmationTimeout => "confirmation timed out".to_string(),
            EndReason::RoundLimit => "round limit reached".to_string(),
            EndReason::NoHumans => "no human participants".to_string(),
        }
    }
}

/// Result of a completed game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSummary {
    /// Every resolved round, in order.
    pub results: Vec<RoundResult>,
    /// Why it stopped.
    pub end_reason: EndReason,
}

impl GameSummary {
    /// Number of rounds resolved.
    pub fn rounds_played(&self) -> u32 {
        self.results.len() as u32
    }
}

/// What the current round has collected so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundProgress {
    /// Current round (0 before the first).
    pub round: u32,
    /// Moves recorded.
    pub moves: usize,
    /// Distinct voters recorded.
    pub votes: usize,
}

/// Round timing.
#[derive(Debug, Clone)]
pub struct RoundTimings {
    /// Move collection bound.
    pub submission_timeout: Duration,
    /// Vote collection bound.
    pub confirmation_timeout: Duration,
    /// Abort acknowledgement bound.
    pub abort_ack_timeout: Duration,
    /// Stop after this many rounds.
    pub max_rounds: Option<u32>,
}

impl From<&SessionConfig> for RoundTimings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            submission_timeout: config.submission_timeout,
            confirmation_timeout: config.confirmation_timeout,
            abort_ack_timeout: config.abort_ack_timeout,
            max_rounds: config.max_rounds,
        }
    }
}

struct InboxState {
    round: u32,
    submission: RoundSubmission,
    tally: ConfirmationTally,
    departed: BTreeSet<ParticipantId>,
    aborting: bool,
    abort_acks: BTreeSet<ParticipantId>,
    moves_in: Signal,
    votes_in: Signal,
    aborts_in: Signal,
}

/// Collects inbound notifications for the current round.
struct Inbox {
    humans: BTreeSet<ParticipantId>,
    state: Mutex<InboxState>,
}

impl Inbox {
    fn new(humans: BTreeSet<ParticipantId>) -> Self {
        Self {
            humans,
            state: Mutex::new(InboxState {
                round: 0,
                submission: RoundSubmission::new(std::iter::empty()),
                tally: ConfirmationTally::new(std::iter::empty()),
                departed: BTreeSet::new(),
                aborting: false,
                abort_acks: BTreeSet::new(),
                moves_in: Signal::new(),
                votes_in: Signal::new(),
                aborts_in: Signal::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset for `round`; returns the (moves, votes) completion signals.
    fn begin_round(&self, round: u32, slots: &RoundSlots) -> (Signal, Signal) {
        let mut state = self.lock();
        state.round = round;
        state.submission = RoundSubmission::new(slots.both().map(|p| p.id));
        state.tally = ConfirmationTally::new(self.humans.iter().copied());
        state.moves_in = Signal::new();
        state.votes_in = Signal::new();
        let departed: Vec<_> = state.departed.iter().copied().collect();
        for id in departed {
            let _ = state.tally.record(id, false);
        }
        self.check(&mut state);
        (state.moves_in.clone(), state.votes_in.clone())
    }

    /// Record a move on behalf of a synthetic participant.
    fn submit_synthetic(&self, id: ParticipantId, choice: Move) {
        let mut state = self.lock();
        if let Err(e) = state.submission.record(id, choice) {
            warn!(participant = %id, "Synthetic move rejected: {}", e);
        }
        self.check(&mut state);
    }

    /// Fill every missing move randomly and hand out the submission.
    fn close_submissions(&self, rng: &mut DeterministicRng) -> RoundSubmission {
        let mut state = self.lock();
        for id in state.submission.missing() {
            let choice = Move::random(rng);
            info!(participant = %id, round = state.round, choice = %choice, "Back-filled missing move");
            let _ = state.submission.record(id, choice);
        }
        state.submission.clone()
    }

    fn verdict(&self) -> (TallyVerdict, bool) {
        let state = self.lock();
        let verdict = state.tally.verdict();
        let departed = matches!(verdict, TallyVerdict::Quit(id) if state.departed.contains(&id));
        (verdict, departed)
    }

    /// Switch to abort mode; returns the acknowledgement signal.
    fn begin_abort(&self) -> Signal {
        let mut state = self.lock();
        state.aborting = true;
        state.aborts_in = Signal::new();
        self.check(&mut state);
        state.aborts_in.clone()
    }

    fn progress(&self) -> RoundProgress {
        let state = self.lock();
        RoundProgress {
            round: state.round,
            moves: state.submission.len(),
            votes: state.tally.len(),
        }
    }

    fn check(&self, state: &mut InboxState) {
        if state.submission.missing().iter().all(|id| state.departed.contains(id)) {
            state.moves_in.signal();
        }
        if state.tally.verdict() != TallyVerdict::Pending {
            state.votes_in.signal();
        }
        let settled = |id: &ParticipantId| state.abort_acks.contains(id) || state.departed.contains(id);
        if state.aborting && self.humans.iter().all(settled) {
            state.aborts_in.signal();
        }
    }

    fn handle(&self, event: InboundEvent) -> Result<(), String> {
        let sender = event.sender;
        if sender.is_synthetic() {
            return Err("synthetic ids cannot submit".into());
        }
        if !self.humans.contains(&sender) {
            return Err("unknown participant".into());
        }

        let mut state = self.lock();
        match event.kind {
            InboundKind::MoveSelected { round, choice } => {
                if round != state.round {
                    return Err(format!("stale round {round}, current is {}", state.round));
                }
                let choice: Move = choice.parse().map_err(|e| format!("{e}"))?;
                state.submission.record(sender, choice).map_err(|e| e.to_string())?;
                debug!(participant = %sender, round, "Move recorded");
            }
            InboundKind::ResultConfirmed { round, keep_playing } => {
                if round != state.round {
                    return Err(format!("stale confirmation for round {round}"));
                }
                state.tally.record(sender, keep_playing).map_err(|e| e.to_string())?;
                debug!(participant = %sender, round, keep_playing, "Vote recorded");
            }
            InboundKind::AbortConfirmed => {
                state.abort_acks.insert(sender);
            }
            InboundKind::Departed => {
                info!(participant = %sender, round = state.round, "Participant departed mid-game");
                state.departed.insert(sender);
                let _ = state.tally.record(sender, false);
            }
        }
        self.check(&mut state);
        Ok(())
    }
}

impl InboundHandler for Inbox {
    fn on_inbound(&self, event: InboundEvent) {
        let sender = event.sender;
        if let Err(reason) = self.handle(event) {
            debug!(participant = %sender, reason = %reason, "Inbound event rejected");
        }
    }
}

/// Runs the rounds of one game.
pub struct RoundCoordinator {
    slots: RoundSlots,
    humans: Vec<Participant>,
    channel: Arc<dyn EventChannel>,
    timings: RoundTimings,
    seed: u64,
    inbox: Arc<Inbox>,
}

impl RoundCoordinator {
    /// Coordinator for the frozen `roster`. `seed` drives every random move.
    pub fn new(
        roster: &[Participant],
        channel: Arc<dyn EventChannel>,
        timings: RoundTimings,
        seed: u64,
    ) -> Self {
        let slots = RoundSlots::assign(roster);
        let humans: Vec<Participant> = slots.humans().cloned().collect();
        let inbox = Arc::new(Inbox::new(humans.iter().map(|p| p.id).collect()));
        Self {
            slots,
            humans,
            channel,
            timings,
            seed,
            inbox,
        }
    }

    /// Slot assignment used for every round.
    pub fn slots(&self) -> &RoundSlots {
        &self.slots
    }

    /// What the current round has collected.
    pub fn progress(&self) -> RoundProgress {
        self.inbox.progress()
    }

    fn send(&self, recipient: ParticipantId, event: OutboundEvent) {
        if let Err(e) = self.channel.deliver(recipient, event) {
            warn!(participant = %recipient, channel = self.channel.kind(), "Delivery failed: {}", e);
        }
    }

    fn opponent_name(&self, id: ParticipantId) -> String {
        self.slots
            .opponent_of(id)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    /// Play rounds until the game ends.
    ///
    /// Installs the coordinator's inbound handler on the channel; it stays
    /// installed so a later `abort` can collect acknowledgements.
    #[instrument(skip_all, fields(channel = self.channel.kind()))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<GameSummary, CoordinatorError> {
        self.channel.subscribe(self.inbox.clone());
        let mut rng = DeterministicRng::new(self.seed);
        let mut results = Vec::new();

        for human in &self.humans {
            self.send(
                human.id,
                OutboundEvent::PlayersReady {
                    self_name: human.name.clone(),
                    opponent_name: self.opponent_name(human.id),
                },
            );
        }

        let mut round = 1u32;
        loop {
            let (result, votes_in) = self.play_round(round, &mut rng, cancel).await?;
            let can_continue = result.can_continue;
            results.push(result);

            if self.humans.is_empty() {
                return Ok(self.finish(results, EndReason::NoHumans));
            }
            if !can_continue {
                return Ok(self.finish(results, EndReason::RoundLimit));
            }

            if votes_in
                .wait(Some(self.timings.confirmation_timeout), cancel)
                .await?
                == WaitOutcome::TimedOut
            {
                info!(round, "Confirmation timed out");
            }

            match self.inbox.verdict() {
                (TallyVerdict::Continue, _) => {
                    debug!(round, "Everyone continues");
                    round += 1;
                }
                (TallyVerdict::Quit(id), true) => {
                    return Ok(self.finish(results, EndReason::Departed(id)));
                }
                (TallyVerdict::Quit(id), false) => {
                    return Ok(self.finish(results, EndReason::Quit(id)));
                }
                (TallyVerdict::Pending, _) => {
                    return Ok(self.finish(results, EndReason::ConfirmationTimeout));
                }
            }
        }
    }

    fn finish(&self, results: Vec<RoundResult>, end_reason: EndReason) -> GameSummary {
        info!(rounds = results.len(), reason = %end_reason.describe(), "Game over");
        GameSummary { results, end_reason }
    }

    async fn play_round(
        &self,
        round: u32,
        rng: &mut DeterministicRng,
        cancel: &CancellationToken,
    ) -> Result<(RoundResult, Signal), CoordinatorError> {
        let (moves_in, votes_in) = self.inbox.begin_round(round, &self.slots);
        info!(round, first = %self.slots.first.id, second = %self.slots.second.id, "Round started");

        for human in &self.humans {
            self.send(
                human.id,
                OutboundEvent::RoundStarted {
                    round,
                    self_name: human.name.clone(),
                    opponent_name: self.opponent_name(human.id),
                },
            );
        }
        for synthetic in self.slots.synthetics() {
            self.inbox.submit_synthetic(synthetic.id, Move::random(rng));
        }

        if moves_in
            .wait(Some(self.timings.submission_timeout), cancel)
            .await?
            == WaitOutcome::TimedOut
        {
            info!(round, "Submission timed out");
        }
        let submission = self.inbox.close_submissions(rng);

        let can_continue =
            !self.humans.is_empty() && self.timings.max_rounds.map_or(true, |max| round < max);
        let result = RoundResult::resolve(round, &self.slots, &submission, can_continue)
            .map_err(|source| CoordinatorError::Resolution { round, source })?;
        info!(
            round,
            first = %result.first.choice,
            second = %result.second.choice,
            first_outcome = ?result.first.outcome,
            "Round resolved"
        );

        for human in &self.humans {
            self.send(human.id, OutboundEvent::result_for(&result, human.id));
        }
        Ok((result, votes_in))
    }

    /// Tell every human the game is aborted and wait (bounded) for them to
    /// acknowledge.
    pub async fn abort(&self, reason: &str, cancel: &CancellationToken) -> Result<WaitOutcome, WaitError> {
        warn!(reason, "Aborting game");
        self.channel.subscribe(self.inbox.clone());
        let acked = self.inbox.begin_abort();
        for human in &self.humans {
            self.send(
                human.id,
                OutboundEvent::GameAborted {
                    reason: reason.to_string(),
                },
            );
        }
        acked.wait(Some(self.timings.abort_ack_timeout), cancel).await
    }
}
