//! Allocation
//!
//! The external matchmaker decides who is expected in this session and how
//! many must connect before play starts. The host only asks once.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::participant::SLOT_COUNT;

/// Allocation errors.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Matchmaker could not be reached.
    #[error("allocation service unavailable: {0}")]
    Unavailable(String),
    /// Matchmaker answered with something unusable.
    #[error("invalid roster: {0}")]
    InvalidRoster(String),
}

/// Who is expected in this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    /// Subjects allowed to join. Empty admits anyone.
    pub expected: Vec<String>,
    /// Participants required before play starts.
    pub required_players: usize,
}

impl Roster {
    /// Reject rosters the session cannot honour.
    pub fn validate(&self) -> Result<(), AllocationError> {
        if self.required_players == 0 || self.required_players > SLOT_COUNT {
            return Err(AllocationError::InvalidRoster(format!(
                "required players {} outside 1..={}",
                self.required_players, SLOT_COUNT
            )));
        }
        if self.expected.len() > SLOT_COUNT {
            return Err(AllocationError::InvalidRoster(format!(
                "{} expected participants for {} slots",
                self.expected.len(),
                SLOT_COUNT
            )));
        }
        Ok(())
    }
}

/// One-shot roster fetch.
pub trait AllocationClient: Send + Sync {
    /// Fetch the roster for this session.
    fn fetch_roster(&self) -> impl Future<Output = Result<Roster, AllocationError>> + Send;
}

/// Roster known at startup.
#[derive(Debug, Clone)]
pub struct StaticAllocation {
    roster: Roster,
}

impl StaticAllocation {
    /// Serve `roster`.
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }

    /// Roster from `DUEL_ROSTER` (comma-separated subjects) with the given
    /// required count.
    pub fn from_env(required_players: usize) -> Self {
        let expected = std::env::var("DUEL_ROSTER")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Self::new(Roster {
            expected,
            required_players,
        })
    }
}

impl AllocationClient for StaticAllocation {
    async fn fetch_roster(&self) -> Result<Roster, AllocationError> {
        self.roster.validate()?;
        Ok(self.roster.clone())
    }
}
