use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::CodecError;

/// Liveness belief about a member. Variants are ordered by precedence: when two
/// records carry the same generation, the higher state wins.
///
/// `Pruned` is local-only. It marks the final removal of a member from the table
/// and is never written to or accepted from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemberState {
    Alive = 0,
    Suspicious = 1,
    Dead = 2,
    Left = 3,
    Pruned = 4,
}

impl MemberState {
    /// Check if the state is considered active (Alive or Suspicious)
    pub fn is_active(&self) -> bool {
        matches!(self, MemberState::Alive | MemberState::Suspicious)
    }

    /// Dead and Left members are candidates for pruning.
    pub fn is_down(&self) -> bool {
        matches!(self, MemberState::Dead | MemberState::Left)
    }

    /// Decodes a state byte received from a peer.
    pub(crate) fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(MemberState::Alive),
            1 => Ok(MemberState::Suspicious),
            2 => Ok(MemberState::Dead),
            3 => Ok(MemberState::Left),
            _ => Err(CodecError::UnknownMemberState(value)),
        }
    }
}

impl Default for MemberState {
    fn default() -> Self {
        MemberState::Alive
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Alive => write!(f, "Alive"),
            MemberState::Suspicious => write!(f, "Suspicious"),
            MemberState::Dead => write!(f, "Dead"),
            MemberState::Left => write!(f, "Left"),
            MemberState::Pruned => write!(f, "Pruned"),
        }
    }
}
