//! One-shot Signals
//!
//! `Signal` is the single awaitable primitive of the crate. It fires at most
//! once, can be triggered from any task or thread, and every wait accepts an
//! optional timeout plus a cooperative cancellation token.
//!
//! `Latch<T>` layers a captured value on top of a `Signal` for events that
//! must report *what* happened (the frozen roster, a failure reason) to
//! waiters that attach before or after the fact.
//!
//! ## Race rules
//!
//! When signal, timeout and cancellation race, the first to resolve wins:
//!
//! ```text
//! already signalled  -> Signalled (even if the token is cancelled)
//! token cancelled    -> Err(Cancelled)
//! timeout == 0       -> TimedOut without suspending
//! otherwise          -> select(signal, cancel, deadline), biased in that order
//! ```

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Result of a wait that was not cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The signal fired before the deadline.
    Signalled,
    /// The deadline elapsed first.
    TimedOut,
}

impl WaitOutcome {
    /// True if the signal fired.
    pub fn is_signalled(self) -> bool {
        matches!(self, WaitOutcome::Signalled)
    }
}

/// Wait errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The cancellation token fired before the signal.
    #[error("wait cancelled")]
    Cancelled,
}

struct SignalInner {
    fired: AtomicBool,
    notify: Notify,
}

/// Idempotent one-shot notification.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_signalled())
            .finish()
    }
}

impl Signal {
    /// Create an unfired signal. No wait is started.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                fired: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Fire the signal.
    ///
    /// Returns true only for the call that actually fired it; later calls
    /// are no-ops.
    pub fn signal(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Has the signal fired.
    pub fn is_signalled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Wait for the signal.
    ///
    /// `timeout` of `None` waits forever; `Some(Duration::ZERO)` only
    /// inspects the current state.
    pub async fn wait(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, WaitError> {
        // Register interest before reading the flag so a concurrent
        // `signal()` between the two cannot be missed.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_signalled() {
            return Ok(WaitOutcome::Signalled);
        }
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        let deadline = match timeout {
            Some(limit) if limit.is_zero() => return Ok(WaitOutcome::TimedOut),
            Some(limit) => Some(Instant::now() + limit),
            None => None,
        };
        let expiry = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut notified => Ok(WaitOutcome::Signalled),
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            _ = expiry => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Wait without a cancellation source.
    pub async fn wait_for(&self, timeout: Option<Duration>) -> WaitOutcome {
        let never = CancellationToken::new();
        match self.wait(timeout, &never).await {
            Ok(outcome) => outcome,
            // `never` is local and cannot be cancelled.
            Err(WaitError::Cancelled) => WaitOutcome::TimedOut,
        }
    }
}

/// Latched event carrying a value.
///
/// The first `set` wins and wakes every waiter; waiters arriving later see
/// the captured value immediately.
pub struct Latch<T> {
    value: OnceLock<T>,
    signal: Signal,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("value", &self.value.get()).finish()
    }
}

impl<T> Latch<T> {
    /// Create an unset latch.
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            signal: Signal::new(),
        }
    }

    /// Capture `value` and fire. Returns false if already set.
    pub fn set(&self, value: T) -> bool {
        if self.value.set(value).is_err() {
            return false;
        }
        self.signal.signal();
        true
    }

    /// Has a value been captured.
    pub fn is_set(&self) -> bool {
        self.value.get().is_some()
    }

    /// Borrow the captured value.
    pub fn peek(&self) -> Option<&T> {
        self.value.get()
    }

    /// The underlying signal, for composing with other waits.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

impl<T: Clone> Latch<T> {
    /// Clone out the captured value.
    pub fn get(&self) -> Option<T> {
        self.value.get().cloned()
    }

    /// Wait for the value. `Ok(None)` means the timeout elapsed first.
    pub async fn wait(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, WaitError> {
        match self.signal.wait(timeout, cancel).await? {
            WaitOutcome::Signalled => Ok(self.get()),
            WaitOutcome::TimedOut => Ok(None),
        }
    }
}
