//! A coverage record moves through three states:
//!  Pending === the range has been requested and its request nonce is still open
//!  Ready === the request completed, the response is waiting to be handed to the consumer
//!  Processed === the consumer drained the response, the range is covered

use serde::{Deserialize, Serialize};

/// Key code used when the state is a component of a storage key. Codes sort in lifecycle order.
pub const COVERAGE_PENDING_CODE: u8 = 1;
/// See [`COVERAGE_PENDING_CODE`].
pub const COVERAGE_READY_CODE: u8 = 2;
/// See [`COVERAGE_PENDING_CODE`].
pub const COVERAGE_PROCESSED_CODE: u8 = 3;

/// Lifecycle state of a date range tracked for one account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoverageState {
    /// dispatched to the request coordinator, waiting for completion
    Pending,
    /// request complete, response not yet consumed
    Ready,
    /// consumed. only processed records count as coverage
    Processed,
}

impl CoverageState {
    /// All states in lifecycle order.
    pub const ALL: [CoverageState; 3] = [Self::Pending, Self::Ready, Self::Processed];

    /// The byte written into composite storage keys.
    /// # Examples
    ///
    /// ```
    /// use ledger_status::coverage_state::CoverageState;
    ///
    /// assert!(CoverageState::Pending.key_code() < CoverageState::Processed.key_code());
    /// assert_eq!(
    ///     CoverageState::from_key_code(CoverageState::Ready.key_code()),
    ///     Some(CoverageState::Ready)
    /// );
    /// ```
    pub fn key_code(&self) -> u8 {
        match self {
            Self::Pending => COVERAGE_PENDING_CODE,
            Self::Ready => COVERAGE_READY_CODE,
            Self::Processed => COVERAGE_PROCESSED_CODE,
        }
    }

    /// Inverse of [`CoverageState::key_code`].
    pub fn from_key_code(code: u8) -> Option<Self> {
        match code {
            COVERAGE_PENDING_CODE => Some(Self::Pending),
            COVERAGE_READY_CODE => Some(Self::Ready),
            COVERAGE_PROCESSED_CODE => Some(Self::Processed),
            _ => None,
        }
    }

    /// A request nonce is only meaningful while the range has not been processed.
    pub fn holds_nonce(&self) -> bool {
        !matches!(self, Self::Processed)
    }

    /// Pending and Ready ranges are in flight: they must not be requested again.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

impl std::fmt::Display for CoverageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CoverageState::*;
        match self {
            Pending => write!(f, "pending"),
            Ready => write!(f, "ready"),
            Processed => write!(f, "processed"),
        }
    }
}

impl From<CoverageState> for String {
    fn from(value: CoverageState) -> Self {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_codes_round_trip_for_every_state() {
        for state in CoverageState::ALL {
            assert_eq!(CoverageState::from_key_code(state.key_code()), Some(state));
        }
        assert_eq!(CoverageState::from_key_code(0), None);
    }

    #[test]
    fn only_unprocessed_states_are_in_flight() {
        assert!(CoverageState::Pending.is_in_flight());
        assert!(CoverageState::Ready.is_in_flight());
        assert!(!CoverageState::Processed.is_in_flight());
        assert!(!CoverageState::Processed.holds_nonce());
    }
}
