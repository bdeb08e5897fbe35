//! Session Context
//!
//! The one session this process hosts, constructed once in `main` and
//! handed around by reference. Owns the tracker, gate, channel and
//! lifecycle and runs them in order:
//!
//! ```text
//! prepare:  fetch roster -> required count, roster filter
//! run:      gate ready -> wait for players -> open channel
//!           -> wait (bounded) until everyone is reachable -> coordinator task -> GameEnded | Failed (abort broadcast)
//! teardown: unsubscribe hooks -> cancel shutdown -> refuse pending approvals
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::rng::derive_session_seed;
use crate::core::signal::{WaitError, WaitOutcome};
use crate::network::auth::{ConnectionValidator, RosterValidator};
use crate::network::channel::EventChannel;
use crate::network::gate::ConnectionGate;
use crate::network::tracker::{ConnectionTracker, TrackerError};
use crate::session::coordinator::{CoordinatorError, GameSummary, RoundCoordinator, RoundTimings};
use crate::session::lifecycle::{LifecycleError, SessionLifecycle, SessionState};
use crate::session::matchmaking::{AllocationClient, AllocationError};
use crate::session::shutdown::ProcessTerminator;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Roster could not be fetched.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// Roster conflicts with the tracker.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// Teardown cancelled the session.
    #[error("session cancelled")]
    Cancelled,
}

impl From<WaitError> for SessionError {
    fn from(_: WaitError) -> Self {
        SessionError::Cancelled
    }
}

/// How `run` finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Not enough players in time.
    StartFailed,
    /// The game finished.
    Completed(GameSummary),
    /// The game was aborted by a fault.
    Aborted {
        /// Reason broadcast to participants.
        reason: String,
    },
}

/// Process-scoped session composition.
pub struct SessionContext {
    session_id: Uuid,
    config: SessionConfig,
    tracker: Arc<ConnectionTracker>,
    roster: Arc<RosterValidator>,
    gate: Arc<ConnectionGate>,
    channel: Arc<dyn EventChannel>,
    lifecycle: Arc<SessionLifecycle>,
    cancel: CancellationToken,
    hooks: CancellationToken,
    watch: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    /// Wire a session around `channel`, validating identities with
    /// `validator` and terminating through `terminator`.
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn EventChannel>,
        validator: Arc<dyn ConnectionValidator>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let tracker = Arc::new(ConnectionTracker::new(config.required_players));
        let lifecycle = Arc::new(SessionLifecycle::new(
            config.clone(),
            tracker.clone(),
            terminator,
        ));
        let roster = Arc::new(RosterValidator::new(validator));
        let gate = Arc::new(ConnectionGate::new(
            tracker.clone(),
            roster.clone(),
            lifecycle.game_started(),
        ));
        info!(session = %short_id(&session_id), channel = channel.kind(), "Session created");

        Self {
            session_id,
            config,
            tracker,
            roster,
            gate,
            channel,
            lifecycle,
            cancel: CancellationToken::new(),
            hooks: CancellationToken::new(),
            watch: Mutex::new(None),
        }
    }

    /// Session id.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Connection gate for the transport binding.
    pub fn gate(&self) -> &Arc<ConnectionGate> {
        &self.gate
    }

    /// Tracker shared by gate and lifecycle.
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Lifecycle, for awaiting its latched events or scheduling shutdowns.
    pub fn lifecycle(&self) -> &Arc<SessionLifecycle> {
        &self.lifecycle
    }

    /// Channel the coordinator talks through.
    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }

    /// Cancelled on teardown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the allocation client who is expected and apply it.
    pub async fn prepare<A: AllocationClient>(&self, allocation: &A) -> Result<(), SessionError> {
        let roster = match allocation.fetch_roster().await {
            Ok(roster) => roster,
            Err(e) => {
                self.lifecycle.fail(format!("allocation failed: {e}"), 0);
                return Err(e.into());
            }
        };
        self.tracker.set_required(roster.required_players)?;
        info!(
            required = roster.required_players,
            expected = roster.expected.len(),
            "Roster applied"
        );
        self.roster.set_roster(roster.expected);
        Ok(())
    }

    /// Run the session to a terminal state.
    #[instrument(skip(self), fields(session = %short_id(&self.session_id)))]
    pub async fn run(&self) -> Result<SessionOutcome, SessionError> {
        let watch = self.lifecycle.spawn_event_watch(self.hooks.clone());
        *self.watch.lock().unwrap_or_else(PoisonError::into_inner) = Some(watch);

        let released = self.gate.mark_gameplay_ready();
        if released > 0 {
            info!(released, "Released pending connections");
        }

        let players = match self.lifecycle.wait_for_players(&self.cancel).await {
            Ok(players) => players,
            Err(LifecycleError::StartTimedOut) => return Ok(SessionOutcome::StartFailed),
            Err(LifecycleError::Cancelled(_)) => return Err(SessionError::Cancelled),
            Err(LifecycleError::InvalidState(state)) => {
                warn!(state = %state, "Session not waiting for players");
                return Ok(SessionOutcome::Aborted {
                    reason: format!("session already {state}"),
                });
            }
        };

        self.channel.open();
        // Approved sockets register with the channel after the tracker has
        // counted them; hold round one until they are reachable.
        let expected: Vec<_> = players.iter().map(|p| p.id).collect();
        let reachable = self.channel.expect_recipients(&expected);
        if reachable.wait(Some(self.config.attach_timeout), &self.cancel).await? == WaitOutcome::TimedOut {
            let present = self.channel.recipients();
            let missing: Vec<String> = expected
                .iter()
                .filter(|id| !present.contains(*id))
                .map(ToString::to_string)
                .collect();
            warn!(missing = ?missing, "Starting without every participant reachable");
        }

        let ids: Vec<u64> = players.iter().map(|p| p.id.get()).collect();
        let seed = derive_session_seed(self.session_id.as_bytes(), rand::random(), &ids);
        let coordinator = Arc::new(RoundCoordinator::new(
            &players,
            self.channel.clone(),
            RoundTimings::from(&self.config),
            seed,
        ));

        let task = {
            let coordinator = coordinator.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move { coordinator.run(&cancel).await })
        };

        let fault = match task.await {
            Ok(Ok(summary)) => {
                if let Err(e) = self
                    .lifecycle
                    .finish_game(summary.end_reason.describe(), summary.rounds_played())
                {
                    warn!("Game finished outside InGame: {}", e);
                }
                return Ok(SessionOutcome::Completed(summary));
            }
            Ok(Err(CoordinatorError::Cancelled(_))) => return Err(SessionError::Cancelled),
            Ok(Err(e)) => {
                error!(origin = "coordinator", "Round coordination failed: {}", e);
                e.to_string()
            }
            Err(join) if join.is_panic() => {
                error!(origin = "coordinator", "Round coordinator panicked");
                "internal server error".to_string()
            }
            Err(join) => {
                error!(origin = "coordinator", "Round coordinator stopped: {}", join);
                "internal server error".to_string()
            }
        };

        let rounds = coordinator.progress().round;
        let reason = format!("game aborted: {fault}");
        if let Err(WaitError::Cancelled) = coordinator.abort(&reason, &self.cancel).await {
            warn!("Abort acknowledgement wait cancelled");
        }
        self.lifecycle.fail(reason.clone(), rounds);
        Ok(SessionOutcome::Aborted { reason })
    }

    /// Tear the session down: unsubscribe hooks, cancel the shutdown timer,
    /// refuse queued approvals, cancel outstanding waits.
    pub fn teardown(&self, reason: &str) {
        self.hooks.cancel();
        if let Some(watch) = self.watch.lock().unwrap_or_else(PoisonError::into_inner).take() {
            watch.abort();
        }
        self.channel.unsubscribe();
        self.lifecycle.cancel_shutdown();
        self.gate.close(reason);
        self.cancel.cancel();
        info!(
            session = %short_id(&self.session_id),
            state = %self.lifecycle.state(),
            "Session torn down"
        );
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }
}

fn short_id(id: &Uuid) -> String {
    hex::encode(&id.as_bytes()[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::moves::Outcome;
    use crate::game::participant::ParticipantId;
    use crate::network::auth::OpenValidator;
    use crate::network::channel::{InboundKind, OutboundEvent};
    use crate::network::gate::ConnectionRequest;
    use crate::network::local::LocalChannel;
    use crate::session::coordinator::EndReason;
    use crate::session::matchmaking::{Roster, StaticAllocation};
    use crate::session::shutdown::{ShutdownKind, TokenTerminator};
    use crate::config::HostConfig;
    use crate::network::networked::NetworkedChannel;
    use crate::network::protocol::ServerMessage;
    use crate::network::server::GameServer;
    use futures_util::{SinkExt, Stream, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    fn context(
        config: SessionConfig,
    ) -> (Arc<SessionContext>, Arc<LocalChannel>, Arc<TokenTerminator>) {
        let channel = Arc::new(LocalChannel::new());
        let terminator = Arc::new(TokenTerminator::new(CancellationToken::new()));
        let context = Arc::new(SessionContext::new(
            config,
            channel.clone(),
            Arc::new(OpenValidator),
            terminator.clone(),
        ));
        (context, channel, terminator)
    }

    fn join(id: u64, name: &str) -> ConnectionRequest {
        ConnectionRequest::new(ParticipantId(id), [("name".to_string(), name.to_string())])
    }

    async fn until_result(rx: &mut UnboundedReceiver<OutboundEvent>) -> crate::game::round::PersonalizedResult {
        loop {
            match rx.recv().await.expect("listener closed") {
                OutboundEvent::RoundResult(result) => return result,
                _ => continue,
            }
        }
    }

    async fn until_round_started(rx: &mut UnboundedReceiver<OutboundEvent>) {
        loop {
            if let OutboundEvent::RoundStarted { .. } = rx.recv().await.expect("listener closed") {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_rock_paper_then_quit() {
        let (context, channel, terminator) = context(SessionConfig::default());
        context
            .prepare(&StaticAllocation::new(Roster {
                expected: Vec::new(),
                required_players: 2,
            }))
            .await
            .unwrap();

        // Both connect before gameplay is ready and are held pending.
        let ana = context.gate().admit(join(1, "ana"));
        let ben = context.gate().admit(join(2, "ben"));
        assert!(ana.response.pending && ben.response.pending);
        let mut ana_rx = channel.attach(ParticipantId(1));
        let mut ben_rx = channel.attach(ParticipantId(2));

        let run = {
            let context = context.clone();
            tokio::spawn(async move { context.run().await })
        };
        assert!(ana.finalize().await.approved);
        assert!(ben.finalize().await.approved);

        assert_eq!(ana_rx.recv().await, Some(OutboundEvent::ChannelReady));
        until_round_started(&mut ana_rx).await;
        until_round_started(&mut ben_rx).await;
        assert_eq!(context.state(), SessionState::InGame);

        channel.inject(ParticipantId(1), InboundKind::MoveSelected { round: 1, choice: "rock".into() });
        channel.inject(ParticipantId(2), InboundKind::MoveSelected { round: 1, choice: "paper".into() });
        assert_eq!(until_result(&mut ana_rx).await.your_outcome, Outcome::Lose);
        assert_eq!(until_result(&mut ben_rx).await.your_outcome, Outcome::Win);

        channel.inject(ParticipantId(1), InboundKind::ResultConfirmed { round: 1, keep_playing: false });
        channel.inject(ParticipantId(2), InboundKind::ResultConfirmed { round: 1, keep_playing: false });

        let outcome = run.await.unwrap().unwrap();
        let SessionOutcome::Completed(summary) = outcome else {
            panic!("Expected completion, got {:?}", outcome);
        };
        assert_eq!(summary.results[0].outcome_for(ParticipantId(1)), Some(Outcome::Lose));
        assert_eq!(summary.results[0].outcome_for(ParticipantId(2)), Some(Outcome::Win));
        assert!(matches!(summary.end_reason, EndReason::Quit(_)));
        assert_eq!(context.state(), SessionState::GameEnded);
        assert_eq!(
            context.lifecycle().pending_shutdown().map(|r| r.kind),
            Some(ShutdownKind::Normal)
        );

        terminator.token().cancelled().await;
        assert_eq!(terminator.request().get().unwrap().kind, ShutdownKind::Normal);

        // Late joiners are turned away once the game started.
        assert!(!context.gate().admit(join(3, "cy")).response.approved);
    }

    async fn next_message<S>(ws: &mut S) -> ServerMessage
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_millis(1500), ws.next())
                .await
                .expect("no message within 1.5s")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_networked_players_held_pending_see_round_start() {
        let config = SessionConfig {
            submission_timeout: Duration::from_secs(3),
            normal_shutdown_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let channel = Arc::new(NetworkedChannel::new());
        let terminator = Arc::new(TokenTerminator::new(CancellationToken::new()));
        let context = Arc::new(SessionContext::new(
            config,
            channel.clone(),
            Arc::new(OpenValidator),
            terminator.clone(),
        ));
        let host = HostConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(host, context.gate().clone(), channel));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        // Both say hello before gameplay is ready and are held pending.
        let mut clients = Vec::new();
        for name in ["ana", "ben"] {
            let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
            let hello = format!(r#"{{"type":"hello","payload":{{"name":"{name}"}}}}"#);
            ws.send(Message::Text(hello)).await.unwrap();
            let ServerMessage::Connection(response) = next_message(&mut ws).await else {
                panic!("expected connection response");
            };
            assert!(response.pending);
            clients.push(ws);
        }

        let run = {
            let context = context.clone();
            tokio::spawn(async move { context.run().await })
        };

        for ws in clients.iter_mut() {
            let mut seen = Vec::new();
            loop {
                match next_message(ws).await {
                    ServerMessage::RoundStarted { round, .. } => {
                        assert_eq!(round, 1);
                        break;
                    }
                    ServerMessage::Connection(response) => assert!(response.approved),
                    other => seen.push(other),
                }
            }
            assert_eq!(seen.first(), Some(&ServerMessage::ChannelReady));
            assert!(seen.iter().any(|m| matches!(m, ServerMessage::PlayersReady { .. })));
        }

        for (ws, choice) in clients.iter_mut().zip(["rock", "paper"]) {
            let select = format!(r#"{{"type":"select_move","round":1,"choice":"{choice}"}}"#);
            ws.send(Message::Text(select)).await.unwrap();
        }
        for ws in clients.iter_mut() {
            while !matches!(next_message(ws).await, ServerMessage::RoundResult(_)) {}
            let quit = r#"{"type":"confirm_result","round":1,"keep_playing":false}"#;
            ws.send(Message::Text(quit.to_string())).await.unwrap();
        }

        let outcome = run.await.unwrap().unwrap();
        let SessionOutcome::Completed(summary) = outcome else {
            panic!("Expected completion, got {:?}", outcome);
        };
        assert_eq!(summary.results[0].outcome_for(ParticipantId(1)), Some(Outcome::Lose));
        assert_eq!(summary.results[0].outcome_for(ParticipantId(2)), Some(Outcome::Win));

        server.shutdown();
        serving.await.unwrap().unwrap();
        context.teardown("test over");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_fails_start() {
        let config = SessionConfig {
            start_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (context, _, terminator) = context(config);
        let outcome = context.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::StartFailed);
        assert_eq!(context.state(), SessionState::StartFailed);

        terminator.token().cancelled().await;
        assert_eq!(terminator.request().get().unwrap().kind, ShutdownKind::StartTimeout);
    }

    #[tokio::test]
    async fn test_allocation_failure_fails_session() {
        let (context, _, _) = context(SessionConfig::default());
        let result = context
            .prepare(&StaticAllocation::new(Roster {
                expected: Vec::new(),
                required_players: 5,
            }))
            .await;
        assert!(matches!(result, Err(SessionError::Allocation(_))));
        assert_eq!(context.state(), SessionState::Failed);
        assert!(context.lifecycle().start_failed().is_set());
        context.teardown("test over");
    }

    #[tokio::test(start_paused = true)]
    async fn test_roster_restricts_admission() {
        let (context, _, _) = context(SessionConfig::default());
        context
            .prepare(&StaticAllocation::new(Roster {
                expected: vec!["ana".into()],
                required_players: 1,
            }))
            .await
            .unwrap();
        assert!(!context.gate().admit(join(2, "ben")).response.pending);
        assert!(context.gate().admit(join(1, "ana")).response.pending);
        context.teardown("test over");
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_refuses_pending_and_cancels() {
        let (context, _, terminator) = context(SessionConfig::default());
        let pending = context.gate().admit(join(1, "ana"));
        context.lifecycle().schedule_shutdown(ShutdownKind::Normal, "test", Duration::from_secs(1));

        context.teardown("server stopping");
        assert!(!pending.finalize().await.approved);
        assert!(context.cancellation().is_cancelled());
        assert!(matches!(context.run().await, Err(SessionError::Cancelled)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!terminator.token().is_cancelled());
    }
}
