//! # RPS Duel Server
//!
//! Dedicated host for one two-participant rock/paper/scissors session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RPS DUEL SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Waiting, timing, randomness               │
//! │  ├── signal.rs   - Signal / Latch with timeout + cancel      │
//! │  ├── delayed.rs  - Last-write-wins delayed action            │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  game/           - Game rules (deterministic)                │
//! │  ├── participant.rs - Ids, synthetic fillers, slots          │
//! │  ├── moves.rs    - Moves and the resolution rule             │
//! │  └── round.rs    - Submissions, confirmations, results       │
//! │                                                              │
//! │  network/        - Transport side (non-deterministic)        │
//! │  ├── auth.rs     - Identity validation                       │
//! │  ├── tracker.rs  - Connected participant tracking            │
//! │  ├── gate.rs     - Connection approval gate                  │
//! │  ├── channel.rs  - EventChannel contract                     │
//! │  ├── local.rs    - In-process channel (practice)             │
//! │  ├── networked.rs- Socket-backed channel                     │
//! │  ├── protocol.rs - JSON wire messages                        │
//! │  └── server.rs   - WebSocket server                          │
//! │                                                              │
//! │  session/        - One session per process                   │
//! │  ├── lifecycle.rs   - Start / end / failure state machine    │
//! │  ├── coordinator.rs - Round orchestration                    │
//! │  ├── shutdown.rs    - Delayed process termination            │
//! │  ├── matchmaking.rs - Roster allocation                      │
//! │  └── context.rs     - Composition root                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! Round resolution and synthetic moves depend only on submissions and the
//! session seed. Given the same seed and the same submissions, a session
//! produces the same results.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;
pub mod session;

// Re-export commonly used types
pub use config::{HostConfig, HostMode, SessionConfig};
pub use core::rng::DeterministicRng;
pub use core::signal::{Latch, Signal, WaitError, WaitOutcome};
pub use game::moves::{Move, Outcome};
pub use game::participant::{Participant, ParticipantId};
pub use session::context::{SessionContext, SessionOutcome};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
