//! RPS Duel Server
//!
//! Hosts a single session, then exits with a code reflecting how it ended.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rps_duel::{
    VERSION,
    config::{HostConfig, HostMode, SessionConfig},
    core::rng::DeterministicRng,
    game::{moves::Move, participant::ParticipantId},
    network::{
        auth::{AuthConfig, ConnectionValidator, NAME_KEY, OpenValidator, TokenValidator},
        channel::{EventChannel, InboundKind, OutboundEvent},
        gate::{ConnectionGate, ConnectionRequest},
        local::LocalChannel,
        networked::NetworkedChannel,
        server::GameServer,
    },
    session::{
        context::{SessionContext, SessionOutcome},
        matchmaking::StaticAllocation,
        shutdown::{ShutdownKind, TokenTerminator},
    },
};

/// Rounds the practice participant plays before voting to stop.
const PRACTICE_ROUNDS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let host = HostConfig::from_env().context("invalid host configuration")?;
    let mut session_config = SessionConfig::from_env().context("invalid session configuration")?;
    if host.mode == HostMode::Local {
        // One human against the filler.
        session_config.required_players = 1;
    }
    session_config.validate().context("invalid session configuration")?;

    info!("RPS Duel Server v{}", VERSION);
    info!(mode = ?host.mode, required = session_config.required_players, "Starting session");

    let exit_token = CancellationToken::new();
    let terminator = Arc::new(TokenTerminator::new(exit_token.clone()));
    let validator = build_validator();

    let networked = Arc::new(NetworkedChannel::new());
    let local = Arc::new(LocalChannel::new());
    let channel: Arc<dyn EventChannel> = match host.mode {
        HostMode::Local => local.clone(),
        HostMode::Networked => networked.clone(),
    };

    let context = SessionContext::new(
        session_config.clone(),
        channel,
        validator,
        terminator.clone(),
    );
    let allocation = StaticAllocation::from_env(session_config.required_players);
    if let Err(e) = context.prepare(&allocation).await {
        error!(error = %e, "Session preparation failed");
    }

    let server = match host.mode {
        HostMode::Networked => {
            let server = Arc::new(GameServer::new(host.clone(), context.gate().clone(), networked));
            let task = server.clone();
            tokio::spawn(async move {
                if let Err(e) = task.run().await {
                    error!(error = %e, "Server stopped");
                }
            });
            Some(server)
        }
        HostMode::Local => {
            tokio::spawn(practice_participant(
                context.gate().clone(),
                local,
                context.session_id().as_u128() as u64,
            ));
            None
        }
    };

    if !exit_token.is_cancelled() {
        tokio::select! {
            outcome = context.run() => match outcome {
                Ok(SessionOutcome::Completed(summary)) => {
                    info!(rounds = summary.rounds_played(), reason = %summary.end_reason.describe(), "Game finished");
                }
                Ok(SessionOutcome::StartFailed) => warn!("Not enough players joined in time"),
                Ok(SessionOutcome::Aborted { reason }) => error!(%reason, "Game aborted"),
                Err(e) => warn!(error = %e, "Session stopped early"),
            },
            _ = exit_token.cancelled() => {}
        }
    }

    tokio::select! {
        _ = exit_token.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            context.lifecycle().schedule_shutdown(
                ShutdownKind::Error,
                "interrupted",
                std::time::Duration::ZERO,
            );
            exit_token.cancelled().await;
        }
    }

    if let Some(server) = server {
        server.shutdown();
    }
    context.teardown("server shutting down");

    let code = terminator
        .request()
        .get()
        .map(|request| request.kind.exit_code())
        .unwrap_or(1);
    info!(code, "Exiting");
    std::process::exit(code);
}

/// JWT validation when an issuer is configured, display names otherwise.
fn build_validator() -> Arc<dyn ConnectionValidator> {
    let auth = AuthConfig::from_env();
    if auth.is_configured() {
        info!("Token authentication enabled");
        Arc::new(TokenValidator::new(auth))
    } else {
        warn!("No authentication configured; accepting display names");
        Arc::new(OpenValidator)
    }
}

/// Scripted in-process participant for Local mode.
async fn practice_participant(gate: Arc<ConnectionGate>, channel: Arc<LocalChannel>, seed: u64) {
    let id = ParticipantId(1);
    let mut events: mpsc::UnboundedReceiver<OutboundEvent> = channel.attach(id);
    let admission = gate.admit(ConnectionRequest::new(
        id,
        [(NAME_KEY.to_string(), "Practice".to_string())],
    ));
    let response = admission.finalize().await;
    if !response.approved {
        warn!(reason = ?response.reason, "Practice participant refused");
        channel.detach(id);
        return;
    }

    let mut rng = DeterministicRng::new(seed);
    while let Some(event) = events.recv().await {
        match event {
            OutboundEvent::ChannelReady => info!("Practice channel ready"),
            OutboundEvent::PlayersReady { self_name, opponent_name } => {
                info!("{} vs {}", self_name, opponent_name);
            }
            OutboundEvent::RoundStarted { round, .. } => {
                let choice = Move::random(&mut rng);
                channel.inject(id, InboundKind::MoveSelected { round, choice: choice.to_string() });
            }
            OutboundEvent::RoundResult(result) => {
                info!(
                    round = result.round,
                    you = %result.your_move,
                    opponent = %result.opponent_move,
                    outcome = ?result.your_outcome,
                    "Practice round"
                );
                let keep_playing = result.can_continue && result.round < PRACTICE_ROUNDS;
                channel.inject(id, InboundKind::ResultConfirmed { round: result.round, keep_playing });
            }
            OutboundEvent::GameAborted { reason } => {
                warn!(%reason, "Practice game aborted");
                channel.inject(id, InboundKind::AbortConfirmed);
                break;
            }
        }
    }
}
