//! Shutdown Scheduling
//!
//! One pending shutdown at a time. A new request always replaces the
//! pending one; when the timer fires the process terminator is invoked
//! with the request that armed it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::delayed::DelayedAction;
use crate::core::signal::Latch;

/// Why the process is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownKind {
    /// The game ended normally.
    Normal,
    /// The session failed.
    Error,
    /// Everyone left and nobody came back.
    AllPlayersDisconnected,
    /// Not enough players before the start timeout.
    StartTimeout,
}

impl ShutdownKind {
    /// Process exit code for this kind.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownKind::Normal => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownKind::Normal => "normal",
            ShutdownKind::Error => "error",
            ShutdownKind::AllPlayersDisconnected => "all_players_disconnected",
            ShutdownKind::StartTimeout => "start_timeout",
        };
        f.write_str(name)
    }
}

/// A scheduled shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    /// Kind.
    pub kind: ShutdownKind,
    /// Human-readable reason.
    pub reason: String,
    /// Delay before termination.
    pub delay: Duration,
    /// When the request was made.
    pub requested_at: DateTime<Utc>,
}

/// Ends the process. Invoked once, from the shutdown timer.
pub trait ProcessTerminator: Send + Sync {
    /// Terminate because of `request`.
    fn terminate(&self, request: &ShutdownRequest);
}

/// Exits the process immediately with the kind's exit code.
#[derive(Debug, Default)]
pub struct ExitProcess;

impl ProcessTerminator for ExitProcess {
    fn terminate(&self, request: &ShutdownRequest) {
        info!(kind = %request.kind, reason = %request.reason, "Exiting process");
        std::process::exit(request.kind.exit_code());
    }
}

/// Records the request and cancels a token, leaving the actual exit to
/// whoever owns the token.
#[derive(Debug, Default)]
pub struct TokenTerminator {
    token: CancellationToken,
    request: Latch<ShutdownRequest>,
}

impl TokenTerminator {
    /// Terminator cancelling `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            request: Latch::new(),
        }
    }

    /// The token cancelled on termination.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The request that terminated the process, once it has.
    pub fn request(&self) -> &Latch<ShutdownRequest> {
        &self.request
    }
}

impl ProcessTerminator for TokenTerminator {
    fn terminate(&self, request: &ShutdownRequest) {
        if self.request.set(request.clone()) {
            info!(kind = %request.kind, reason = %request.reason, "Termination requested");
        }
        self.token.cancel();
    }
}

/// Last-write-wins shutdown timer.
pub struct ShutdownScheduler {
    timer: DelayedAction,
    terminator: Arc<dyn ProcessTerminator>,
    pending: Arc<Mutex<Option<(u64, ShutdownRequest)>>>,
    issued: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShutdownScheduler {
    /// Idle scheduler invoking `terminator` when a timer fires.
    pub fn new(terminator: Arc<dyn ProcessTerminator>) -> Self {
        Self {
            timer: DelayedAction::new("shutdown"),
            terminator,
            pending: Arc::new(Mutex::new(None)),
            issued: Mutex::new(0),
        }
    }

    /// Schedule a shutdown, superseding any pending one.
    pub fn schedule(&self, kind: ShutdownKind, reason: impl Into<String>, delay: Duration) -> ShutdownRequest {
        let request = ShutdownRequest {
            kind,
            reason: reason.into(),
            delay,
            requested_at: Utc::now(),
        };

        let mut issued = lock(&self.issued);
        *issued += 1;
        let ticket = *issued;
        if let Some((_, previous)) = lock(&self.pending).replace((ticket, request.clone())) {
            info!(previous = %previous.kind, next = %kind, "Superseding pending shutdown");
        }
        info!(kind = %kind, reason = %request.reason, delay_ms = delay.as_millis() as u64, "Shutdown scheduled");

        let pending = Arc::clone(&self.pending);
        let terminator = Arc::clone(&self.terminator);
        let fired = request.clone();
        self.timer.schedule(delay, move || {
            {
                let mut pending = lock(&pending);
                if matches!(*pending, Some((current, _)) if current == ticket) {
                    *pending = None;
                }
            }
            terminator.terminate(&fired);
            Ok(())
        });
        request
    }

    /// Cancel the pending shutdown. Returns false if none was pending.
    pub fn cancel(&self) -> bool {
        let _issued = lock(&self.issued);
        let previous = lock(&self.pending).take();
        self.timer.cancel();
        match previous {
            Some((_, request)) => {
                warn!(kind = %request.kind, "Pending shutdown cancelled");
                true
            }
            None => false,
        }
    }

    /// The pending request, if any.
    pub fn pending(&self) -> Option<ShutdownRequest> {
        lock(&self.pending).as_ref().map(|(_, request)| request.clone())
    }

    /// Kind of the pending request, if any.
    pub fn pending_kind(&self) -> Option<ShutdownKind> {
        lock(&self.pending).as_ref().map(|(_, request)| request.kind)
    }
}
