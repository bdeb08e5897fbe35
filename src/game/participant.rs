//! Participants and Slots
//!
//! Humans get transport-assigned ids below `SYNTHETIC_ID_BASE`; filler
//! participants live strictly above it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ids above this value are reserved for synthetic participants.
pub const SYNTHETIC_ID_BASE: u64 = 1 << 48;

/// Number of slots in a round.
pub const SLOT_COUNT: usize = 2;

/// Opaque participant identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// Raw id.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Id of the synthetic filler for slot `index` (0-based).
    pub const fn synthetic(index: usize) -> Self {
        Self(SYNTHETIC_ID_BASE + 1 + index as u64)
    }

    /// Is this id in the reserved synthetic range.
    pub const fn is_synthetic(self) -> bool {
        self.0 > SYNTHETIC_ID_BASE
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "bot#{}", self.0 - SYNTHETIC_ID_BASE)
        } else {
            write!(f, "p#{}", self.0)
        }
    }
}

/// A connected (or synthetic) participant with its display name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant id.
    pub id: ParticipantId,
    /// Name shown to the opponent.
    pub name: String,
}

impl Participant {
    /// Create a human participant.
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }

    /// Filler for slot `index`.
    pub fn synthetic(index: usize) -> Self {
        Self {
            id: ParticipantId::synthetic(index),
            name: format!("Bot {}", index + 1),
        }
    }

    /// Is this a filler.
    pub fn is_synthetic(&self) -> bool {
        self.id.is_synthetic()
    }
}

/// Slot assignment for one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundSlots {
    /// Side one; its id decides result personalization.
    pub first: Participant,
    /// Side two.
    pub second: Participant,
}

impl RoundSlots {
    /// Fill both slots from `connected` in connection order, padding with
    /// synthetic participants. Extra entries beyond two are ignored.
    pub fn assign(connected: &[Participant]) -> Self {
        let mut humans = connected.iter().filter(|p| !p.is_synthetic());
        let first = humans.next().cloned().unwrap_or_else(|| Participant::synthetic(0));
        let second = humans.next().cloned().unwrap_or_else(|| Participant::synthetic(1));
        Self { first, second }
    }

    /// Both participants in slot order.
    pub fn both(&self) -> [&Participant; SLOT_COUNT] {
        [&self.first, &self.second]
    }

    /// Non-synthetic participants in slot order.
    pub fn humans(&self) -> impl Iterator<Item = &Participant> {
        self.both().into_iter().filter(|p| !p.is_synthetic())
    }

    /// Synthetic participants in slot order.
    pub fn synthetics(&self) -> impl Iterator<Item = &Participant> {
        self.both().into_iter().filter(|p| p.is_synthetic())
    }

    /// The other side, if `id` holds a slot.
    pub fn opponent_of(&self, id: ParticipantId) -> Option<&Participant> {
        if self.first.id == id {
            Some(&self.second)
        } else if self.second.id == id {
            Some(&self.first)
        } else {
            None
        }
    }

    /// Does `id` hold a slot.
    pub fn contains(&self, id: ParticipantId) -> bool {
        self.first.id == id || self.second.id == id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human(id: u64) -> Participant {
        Participant::new(ParticipantId(id), format!("player-{id}"))
    }

    #[test]
    fn test_synthetic_ids_never_collide_with_transport_ids() {
        assert!(ParticipantId::synthetic(0).is_synthetic());
        assert!(ParticipantId::synthetic(1).is_synthetic());
        assert_ne!(ParticipantId::synthetic(0), ParticipantId::synthetic(1));
        assert!(!ParticipantId(SYNTHETIC_ID_BASE).is_synthetic());
        assert!(!ParticipantId(1).is_synthetic());
    }

    #[test]
    fn test_assign_two_humans_keeps_connection_order() {
        let slots = RoundSlots::assign(&[human(7), human(3)]);
        assert_eq!(slots.first.id, ParticipantId(7));
        assert_eq!(slots.second.id, ParticipantId(3));
        assert_eq!(slots.synthetics().count(), 0);
    }

    #[test]
    fn test_assign_pads_with_synthetics() {
        let slots = RoundSlots::assign(&[human(1)]);
        assert_eq!(slots.first.id, ParticipantId(1));
        assert!(slots.second.is_synthetic());

        let empty = RoundSlots::assign(&[]);
        assert!(empty.first.is_synthetic());
        assert!(empty.second.is_synthetic());
        assert_eq!(empty.humans().count(), 0);
    }

    #[test]
    fn test_assign_ignores_extra_participants() {
        let slots = RoundSlots::assign(&[human(1), human(2), human(3)]);
        assert!(!slots.contains(ParticipantId(3)));
    }

    #[test]
    fn test_opponent_lookup() {
        let slots = RoundSlots::assign(&[human(1), human(2)]);
        assert_eq!(slots.opponent_of(ParticipantId(1)).unwrap().id, ParticipantId(2));
        assert_eq!(slots.opponent_of(ParticipantId(2)).unwrap().id, ParticipantId(1));
        assert!(slots.opponent_of(ParticipantId(9)).is_none());
    }
}
