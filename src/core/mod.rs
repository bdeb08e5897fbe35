//! Core primitives.
//!
//! Waiting, timing and randomness building blocks shared by the network and
//! session layers. Every suspension point in the crate goes through
//! `signal::Signal`.

pub mod signal;
pub mod delayed;
pub mod rng;

// Re-export core types
pub use signal::{Latch, Signal, WaitError, WaitOutcome};
pub use delayed::DelayedAction;
pub use rng::DeterministicRng;
