//! Game Rules Module
//!
//! Pure, deterministic rock/paper/scissors logic. No I/O, no clocks.
//!
//! ## Module Structure
//!
//! - `participant`: Participant ids, synthetic fillers, slot assignment
//! - `moves`: Moves, outcomes, the resolution rule
//! - `round`: Per-round submissions, confirmations and results

pub mod participant;
pub mod moves;
pub mod round;

// Re-export key types
pub use participant::{Participant, ParticipantId, RoundSlots, SYNTHETIC_ID_BASE};
pub use moves::{resolve, Move, MoveError, Outcome};
pub use round::{
    ConfirmationTally, PersonalizedResult, RoundResult, RoundSubmission, SubmissionError,
    TallyVerdict,
};
