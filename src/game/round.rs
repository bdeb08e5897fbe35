//! Round State
//!
//! Per-round submission map, confirmation tally and result. A fresh set is
//! built for every round; nothing carries over.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::moves::{resolve, Move, Outcome};
use crate::game::participant::{ParticipantId, RoundSlots};

/// Round-state errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    /// Sender does not hold a slot this round.
    #[error("participant {0} is not expected this round")]
    UnexpectedParticipant(ParticipantId),
    /// Resolution attempted before every slot submitted.
    #[error("round is missing moves from {0:?}")]
    Incomplete(Vec<ParticipantId>),
}

/// Moves gathered for one round.
#[derive(Clone, Debug)]
pub struct RoundSubmission {
    expected: BTreeSet<ParticipantId>,
    moves: BTreeMap<ParticipantId, Move>,
}

impl RoundSubmission {
    /// Start collecting for `expected` ids.
    pub fn new(expected: impl IntoIterator<Item = ParticipantId>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            moves: BTreeMap::new(),
        }
    }

    /// Record a move. A repeat from the same id overwrites.
    pub fn record(&mut self, id: ParticipantId, mv: Move) -> Result<(), SubmissionError> {
        if !self.expected.contains(&id) {
            return Err(SubmissionError::UnexpectedParticipant(id));
        }
        self.moves.insert(id, mv);
        Ok(())
    }

    /// Has every expected id submitted.
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|id| self.moves.contains_key(id))
    }

    /// Expected ids without a move yet.
    pub fn missing(&self) -> Vec<ParticipantId> {
        self.expected
            .iter()
            .filter(|id| !self.moves.contains_key(id))
            .copied()
            .collect()
    }

    /// Move submitted by `id`.
    pub fn get(&self, id: ParticipantId) -> Option<Move> {
        self.moves.get(&id).copied()
    }

    /// Has `id` submitted.
    pub fn has(&self, id: ParticipantId) -> bool {
        self.moves.contains_key(&id)
    }

    /// Is `id` part of this round.
    pub fn expects(&self, id: ParticipantId) -> bool {
        self.expected.contains(&id)
    }

    /// Number of moves recorded.
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// No moves recorded yet.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Continue/quit votes after a result.
#[derive(Clone, Debug)]
pub struct ConfirmationTally {
    expected: BTreeSet<ParticipantId>,
    votes: BTreeMap<ParticipantId, bool>,
}

/// What the tally currently says.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TallyVerdict {
    /// Still waiting on someone.
    Pending,
    /// Everyone voted to continue.
    Continue,
    /// Someone voted to stop.
    Quit(ParticipantId),
}

impl ConfirmationTally {
    /// Expect a vote from each id.
    pub fn new(expected: impl IntoIterator<Item = ParticipantId>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            votes: BTreeMap::new(),
        }
    }

    /// Record a vote. A repeat overwrites.
    pub fn record(&mut self, id: ParticipantId, keep_playing: bool) -> Result<(), SubmissionError> {
        if !self.expected.contains(&id) {
            return Err(SubmissionError::UnexpectedParticipant(id));
        }
        self.votes.insert(id, keep_playing);
        Ok(())
    }

    /// Current verdict. A quit vote decides immediately.
    pub fn verdict(&self) -> TallyVerdict {
        if let Some((id, _)) = self.votes.iter().find(|(_, keep)| !**keep) {
            return TallyVerdict::Quit(*id);
        }
        if !self.expected.is_empty() && self.expected.iter().all(|id| self.votes.contains_key(id)) {
            TallyVerdict::Continue
        } else {
            TallyVerdict::Pending
        }
    }

    /// Number of distinct voters so far.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// No votes yet.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Is `id` expected to vote.
    pub fn expects(&self, id: ParticipantId) -> bool {
        self.expected.contains(&id)
    }
}

/// One side of a resolved round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideResult {
    /// Who played this side.
    pub participant: ParticipantId,
    /// What they played.
    pub choice: Move,
    /// How it went.
    pub outcome: Outcome,
}

/// Resolved round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    /// 1-based round number.
    pub round: u32,
    /// Slot one.
    pub first: SideResult,
    /// Slot two.
    pub second: SideResult,
    /// Whether another round may follow.
    pub can_continue: bool,
}

/// A result as seen by one participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizedResult {
    /// 1-based round number.
    pub round: u32,
    /// Recipient's move.
    pub your_move: Move,
    /// Recipient's outcome.
    pub your_outcome: Outcome,
    /// Opponent's move.
    pub opponent_move: Move,
    /// Whether another round may follow.
    pub can_continue: bool,
}

impl RoundResult {
    /// Resolve a complete submission.
    pub fn resolve(
        round: u32,
        slots: &RoundSlots,
        submission: &RoundSubmission,
        can_continue: bool,
    ) -> Result<Self, SubmissionError> {
        let missing = submission.missing();
        let (Some(first_move), Some(second_move)) =
            (submission.get(slots.first.id), submission.get(slots.second.id))
        else {
            return Err(SubmissionError::Incomplete(missing));
        };

        let (first_outcome, second_outcome) = resolve(first_move, second_move);
        Ok(Self {
            round,
            first: SideResult {
                participant: slots.first.id,
                choice: first_move,
                outcome: first_outcome,
            },
            second: SideResult {
                participant: slots.second.id,
                choice: second_move,
                outcome: second_outcome,
            },
            can_continue,
        })
    }

    /// Outcome for `id`, if it played.
    pub fn outcome_for(&self, id: ParticipantId) -> Option<Outcome> {
        if self.first.participant == id {
            Some(self.first.outcome)
        } else if self.second.participant == id {
            Some(self.second.outcome)
        } else {
            None
        }
    }

    /// View from `recipient`: anyone who is not slot one sees slot two.
    pub fn personalize(&self, recipient: ParticipantId) -> PersonalizedResult {
        let (own, other) = if recipient == self.first.participant {
            (&self.first, &self.second)
        } else {
            (&self.second, &self.first)
        };
        PersonalizedResult {
            round: self.round,
            your_move: own.choice,
            your_outcome: own.outcome,
            opponent_move: other.choice,
            can_continue: self.can_continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::participant::Participant;

    fn slots() -> RoundSlots {
        RoundSlots::assign(&[
            Participant::new(ParticipantId(1), "ana"),
            Participant::new(ParticipantId(2), "ben"),
        ])
    }

    #[test]
    fn test_submission_rejects_outsiders() {
        let mut sub = RoundSubmission::new([ParticipantId(1), ParticipantId(2)]);
        assert_eq!(
            sub.record(ParticipantId(3), Move::Rock),
            Err(SubmissionError::UnexpectedParticipant(ParticipantId(3)))
        );
        assert!(sub.is_empty());
    }

    #[test]
    fn test_submission_overwrites_and_completes() {
        let mut sub = RoundSubmission::new([ParticipantId(1), ParticipantId(2)]);
        sub.record(ParticipantId(1), Move::Rock).unwrap();
        sub.record(ParticipantId(1), Move::Paper).unwrap();
        assert_eq!(sub.get(ParticipantId(1)), Some(Move::Paper));
        assert!(!sub.is_complete());
        assert_eq!(sub.missing(), vec![ParticipantId(2)]);

        sub.record(ParticipantId(2), Move::Rock).unwrap();
        assert!(sub.is_complete());
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn test_resolve_requires_complete_submission() {
        let slots = slots();
        let mut sub = RoundSubmission::new([ParticipantId(1), ParticipantId(2)]);
        sub.record(ParticipantId(1), Move::Rock).unwrap();
        assert!(matches!(
            RoundResult::resolve(1, &slots, &sub, true),
            Err(SubmissionError::Incomplete(_))
        ));
    }

    #[test]
    fn test_personalized_result() {
        let slots = slots();
        let mut sub = RoundSubmission::new([ParticipantId(1), ParticipantId(2)]);
        sub.record(ParticipantId(1), Move::Rock).unwrap();
        sub.record(ParticipantId(2), Move::Paper).unwrap();

        let result = RoundResult::resolve(1, &slots, &sub, true).unwrap();
        assert_eq!(result.outcome_for(ParticipantId(1)), Some(Outcome::Lose));
        assert_eq!(result.outcome_for(ParticipantId(2)), Some(Outcome::Win));

        let one = result.personalize(ParticipantId(1));
        assert_eq!(one.your_move, Move::Rock);
        assert_eq!(one.your_outcome, Outcome::Lose);
        assert_eq!(one.opponent_move, Move::Paper);

        let two = result.personalize(ParticipantId(2));
        assert_eq!(two.your_move, Move::Paper);
        assert_eq!(two.your_outcome, Outcome::Win);
        assert_eq!(two.opponent_move, Move::Rock);
    }

    #[test]
    fn test_tally_verdicts() {
        let mut tally = ConfirmationTally::new([ParticipantId(1), ParticipantId(2)]);
        assert_eq!(tally.verdict(), TallyVerdict::Pending);

        tally.record(ParticipantId(1), true).unwrap();
        assert_eq!(tally.verdict(), TallyVerdict::Pending);

        tally.record(ParticipantId(2), true).unwrap();
        assert_eq!(tally.verdict(), TallyVerdict::Continue);

        tally.record(ParticipantId(2), false).unwrap();
        assert_eq!(tally.verdict(), TallyVerdict::Quit(ParticipantId(2)));
        assert_eq!(tally.len(), 2);

        assert!(tally.record(ParticipantId(9), true).is_err());
        assert_eq!(tally.len(), 2);
    }

    #[test]
    fn test_empty_tally_never_continues() {
        let tally = ConfirmationTally::new(Vec::<ParticipantId>::new());
        assert_eq!(tally.verdict(), TallyVerdict::Pending);
    }
}
