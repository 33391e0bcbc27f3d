//! A cursor job walks the history of one account in one direction.

use serde::{Deserialize, Serialize};

/// the direction a cursor job pages through the remote history
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum JobDirection {
    /// polls for items newer than the newest known cursor, catching up to the present.
    Forward,
    /// backfills items older than the oldest known cursor, toward genesis.
    Backward,
}

impl JobDirection {
    /// The byte written into composite storage keys.
    pub fn key_code(&self) -> u8 {
        match self {
            JobDirection::Forward => 1,
            JobDirection::Backward => 2,
        }
    }

    /// Inverse of [`JobDirection::key_code`].
    pub fn from_key_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(JobDirection::Forward),
            2 => Some(JobDirection::Backward),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobDirection::Forward => write!(f, "forward"),
            JobDirection::Backward => write!(f, "backward"),
        }
    }
}
