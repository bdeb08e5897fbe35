//! Moves and Resolution
//!
//! Cyclic dominance: Rock beats Scissors, Scissors beats Paper, Paper beats
//! Rock. Equal moves draw. Resolution is symmetric by construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::rng::DeterministicRng;

/// A player's choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    /// Beats scissors.
    Rock,
    /// Beats rock.
    Paper,
    /// Beats paper.
    Scissors,
}

impl Move {
    /// Every move, in a fixed order.
    pub const ALL: [Move; 3] = [Move::Rock, Move::Paper, Move::Scissors];

    /// The move this one defeats.
    pub const fn beats(self) -> Move {
        match self {
            Move::Rock => Move::Scissors,
            Move::Scissors => Move::Paper,
            Move::Paper => Move::Rock,
        }
    }

    /// Uniformly random move.
    pub fn random(rng: &mut DeterministicRng) -> Move {
        Move::ALL[rng.next_int(Move::ALL.len() as u32) as usize]
    }

    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Move::Rock => "rock",
            Move::Paper => "paper",
            Move::Scissors => "scissors",
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Move parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    /// Nothing was chosen.
    #[error("empty move")]
    Empty,
    /// Not one of rock/paper/scissors.
    #[error("unknown move: {0}")]
    Unknown(String),
}

impl FromStr for Move {
    type Err = MoveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MoveError::Empty);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "rock" | "r" => Ok(Move::Rock),
            "paper" | "p" => Ok(Move::Paper),
            "scissors" | "s" => Ok(Move::Scissors),
            _ => Err(MoveError::Unknown(trimmed.to_string())),
        }
    }
}

/// Outcome for one side of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// This side won.
    Win,
    /// This side lost.
    Lose,
    /// Same move on both sides.
    Draw,
}

impl Outcome {
    /// The outcome the other side sees.
    pub const fn mirrored(self) -> Outcome {
        match self {
            Outcome::Win => Outcome::Lose,
            Outcome::Lose => Outcome::Win,
            Outcome::Draw => Outcome::Draw,
        }
    }
}

/// Resolve a pair of moves into (first outcome, second outcome).
pub fn resolve(first: Move, second: Move) -> (Outcome, Outcome) {
    let first_outcome = if first == second {
        Outcome::Draw
    } else if first.beats() == second {
        Outcome::Win
    } else {
        Outcome::Lose
    };
    (first_outcome, first_outcome.mirrored())
}
