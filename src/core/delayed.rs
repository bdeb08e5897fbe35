//! Delayed Actions
//!
//! A single reschedulable timer. Scheduling always replaces whatever was
//! pending; the replaced action never runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Default)]
struct Slot {
    /// Bumped on every schedule; a timer only fires if it still owns the slot.
    generation: u64,
    pending: Option<(u64, CancellationToken)>,
}

/// Cancellable, last-write-wins timer.
///
/// Requires a tokio runtime when scheduling.
pub struct DelayedAction {
    name: &'static str,
    slot: Arc<Mutex<Slot>>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DelayedAction {
    /// Create an idle scheduler. `name` tags log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Replace any pending timer with one that runs `action` after `delay`.
    ///
    /// Errors and panics raised by `action` are logged and contained.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let action: Action = Box::new(action);
        let token = CancellationToken::new();

        let generation = {
            let mut slot = lock(&self.slot);
            if let Some((_, previous)) = slot.pending.take() {
                previous.cancel();
            }
            slot.generation += 1;
            slot.pending = Some((slot.generation, token.clone()));
            slot.generation
        };

        let slot = Arc::clone(&self.slot);
        let name = self.name;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(timer = name, generation, "Delayed action cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // Claim the slot; a reschedule that raced the sleep wins.
            {
                let mut slot = lock(&slot);
                match slot.pending {
                    Some((current, _)) if current == generation => slot.pending = None,
                    _ => return,
                }
            }

            match catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => debug!(timer = name, generation, "Delayed action completed"),
                Ok(Err(e)) => error!(timer = name, generation, "Delayed action failed: {:#}", e),
                Err(_) => error!(timer = name, generation, "Delayed action panicked"),
            }
        });
    }

    /// Abort the pending timer. Returns false if nothing was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = lock(&self.slot);
        match slot.pending.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Is a timer armed and not yet fired.
    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }
}

impl Drop for DelayedAction {
    fn drop(&mut self) {
        self.cancel();
    }
}
