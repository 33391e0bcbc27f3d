//! Module for primitive structs associated with the sync engine

use std::{cmp::Ordering, collections::BTreeSet};

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use ledger_status::{coverage_state::CoverageState, job_direction::JobDirection, rpc_tier::RpcTier};

/// Identifier of a ledger item (a transaction signature or hash).
pub type ItemId = String;

/// Identifier of a range request, used to correlate asynchronously arriving items with their request.
pub type Nonce = u64;

/// Half-open interval `[start, end)` of epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, CopyGetters, Serialize, Deserialize)]
#[getset(get_copy = "pub")]
pub struct DateRange {
    start: u64,
    end: u64,
}

impl DateRange {
    /// Creates a new date range. An inverted range is normalised to an empty range at `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Length of the range in milliseconds.
    pub fn duration(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// `true` when the ranges overlap or share a boundary.
    pub fn touches(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns the newest part of the range no longer than `max_duration`.
    pub fn newest(&self, max_duration: u64) -> DateRange {
        DateRange::new(self.end.saturating_sub(max_duration).max(self.start), self.end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Opaque progress marker returned by the remote ledger. Ordering is by position only.
#[derive(Debug, Clone, Eq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct PaginationCursor {
    #[getset(get = "pub")]
    id: ItemId,
    #[getset(get_copy = "pub")]
    position: u64,
    #[getset(get_copy = "pub")]
    timestamp: u64,
}

impl PaginationCursor {
    pub fn from_parts(id: ItemId, position: u64, timestamp: u64) -> Self {
        Self {
            id,
            position,
            timestamp,
        }
    }
}

impl PartialEq for PaginationCursor {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
    }
}

impl PartialOrd for PaginationCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PaginationCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position.cmp(&other.position)
    }
}

/// One entry of a history page: enough to index an item before its payload is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct ItemRef {
    #[getset(get = "pub")]
    id: ItemId,
    #[getset(get = "pub")]
    account: String,
    #[getset(get_copy = "pub")]
    position: u64,
    #[getset(get_copy = "pub")]
    timestamp: u64,
}

impl ItemRef {
    pub fn from_parts(id: ItemId, account: String, position: u64, timestamp: u64) -> Self {
        Self {
            id,
            account,
            position,
            timestamp,
        }
    }

    pub fn cursor(&self) -> PaginationCursor {
        PaginationCursor::from_parts(self.id.clone(), self.position, self.timestamp)
    }
}

/// A fully fetched ledger item. The payload is not interpreted by the sync engine.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct LedgerItem {
    #[getset(get = "pub")]
    id: ItemId,
    #[getset(get = "pub")]
    account: String,
    #[getset(get_copy = "pub")]
    position: u64,
    #[getset(get_copy = "pub")]
    timestamp: u64,
    #[getset(get = "pub")]
    data: serde_json::Value,
}

impl LedgerItem {
    pub fn from_parts(
        id: ItemId,
        account: String,
        position: u64,
        timestamp: u64,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            account,
            position,
            timestamp,
            data,
        }
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::from_parts(
            self.id.clone(),
            self.account.clone(),
            self.position,
            self.timestamp,
        )
    }
}

/// Persisted progress of one cursor job.
///
/// Mutated only by its own job loop and saved after every run.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct FetchJobState {
    #[getset(get_copy = "pub")]
    pub(crate) direction: JobDirection,
    /// forward: newest item seen. backward: oldest item seen.
    #[getset(get = "pub")]
    pub(crate) cursor: Option<PaginationCursor>,
    /// ids sharing the cursor's position that were already walked
    #[getset(get = "pub")]
    #[serde(default)]
    pub(crate) cursor_siblings: BTreeSet<ItemId>,
    #[getset(get_copy = "pub")]
    pub(crate) frequency_millis: u64,
    #[getset(get_copy = "pub")]
    pub(crate) last_run_at: Option<u64>,
    #[getset(get_copy = "pub")]
    pub(crate) run_count: u64,
    /// terminal for the direction
    #[getset(get_copy = "pub")]
    pub(crate) complete: bool,
    #[getset(get_copy = "pub")]
    pub(crate) rpc_tier: RpcTier,
}

impl FetchJobState {
    pub fn new(direction: JobDirection, frequency_millis: u64) -> Self {
        Self {
            direction,
            cursor: None,
            cursor_siblings: BTreeSet::new(),
            frequency_millis,
            last_run_at: None,
            run_count: 0,
            complete: false,
            rpc_tier: RpcTier::Primary,
        }
    }

    /// Read-only view used for health reporting.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            last_run_at: self.last_run_at,
            frequency_millis: self.frequency_millis,
            run_count: self.run_count,
            complete: self.complete,
            rpc_tier: self.rpc_tier,
        }
    }
}

/// Health of a cursor job as seen from outside its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct JobSnapshot {
    pub last_run_at: Option<u64>,
    pub frequency_millis: u64,
    pub run_count: u64,
    pub complete: bool,
    pub rpc_tier: RpcTier,
}

impl JobSnapshot {
    /// A job is stalled when it has not run for `stall_factor` of its own intervals
    /// (never less than `min_grace_millis`). Complete jobs never stall.
    pub fn is_stalled(&self, now: u64, stall_factor: u64, min_grace_millis: u64) -> bool {
        if self.complete {
            return false;
        }
        let grace = self
            .frequency_millis
            .saturating_mul(stall_factor)
            .max(min_grace_millis);
        match self.last_run_at {
            Some(last_run_at) => now.saturating_sub(last_run_at) > grace,
            None => false,
        }
    }
}

/// What the fetch subsystem knows about an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AccountState {
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub complete_history: bool,
    pub forward: Option<JobSnapshot>,
    pub backward: Option<JobSnapshot>,
}

impl AccountState {
    /// The range of timestamps whose items are fully indexed, `None` until both ends are known.
    pub fn available_range(&self) -> Option<DateRange> {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) if first <= last => {
                Some(DateRange::new(first, last.saturating_add(1)))
            }
            _ => None,
        }
    }
}

/// Coverage bookkeeping for one date range of one account.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct RangeCoverageRecord {
    #[getset(get = "pub")]
    account: String,
    #[getset(get_copy = "pub")]
    state: CoverageState,
    #[getset(get_copy = "pub")]
    range: DateRange,
    #[getset(get_copy = "pub")]
    request_nonce: Option<Nonce>,
}

impl RangeCoverageRecord {
    pub fn pending(account: String, range: DateRange, nonce: Nonce) -> Self {
        Self {
            account,
            state: CoverageState::Pending,
            range,
            request_nonce: Some(nonce),
        }
    }

    pub fn processed(account: String, range: DateRange) -> Self {
        Self {
            account,
            state: CoverageState::Processed,
            range,
            request_nonce: None,
        }
    }

    /// Moves the record to `state`. The nonce is cleared once the range is processed.
    pub fn with_state(&self, state: CoverageState) -> Self {
        Self {
            account: self.account.clone(),
            state,
            range: self.range,
            request_nonce: if state.holds_nonce() {
                self.request_nonce
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_order_by_position_not_id() {
        let older = PaginationCursor::from_parts("zzz".to_string(), 10, 500);
        let newer = PaginationCursor::from_parts("aaa".to_string(), 11, 400);
        assert!(older < newer);
        assert_eq!(
            older,
            PaginationCursor::from_parts("other".to_string(), 10, 0)
        );
    }

    #[test]
    fn newest_keeps_the_end_of_the_range() {
        let range = DateRange::new(1000, 5000);
        assert_eq!(range.newest(2000), DateRange::new(3000, 5000));
        assert_eq!(range.newest(10_000), range);
    }

    #[test]
    fn available_range_includes_last_timestamp() {
        let state = AccountState {
            first_timestamp: Some(1000),
            last_timestamp: Some(4999),
            complete_history: false,
            forward: None,
            backward: None,
        };
        assert_eq!(state.available_range(), Some(DateRange::new(1000, 5000)));
    }

    #[test]
    fn stalled_jobs_are_detected_from_staleness() {
        let snapshot = JobSnapshot {
            last_run_at: Some(1_000),
            frequency_millis: 1_000,
            run_count: 3,
            complete: false,
            rpc_tier: RpcTier::Primary,
        };
        assert!(!snapshot.is_stalled(3_000, 5, 0));
        assert!(snapshot.is_stalled(10_000, 5, 0));
        assert!(!JobSnapshot {
            complete: true,
            ..snapshot
        }
        .is_stalled(10_000, 5, 0));
    }

    #[test]
    fn processing_clears_the_nonce() {
        let record = RangeCoverageRecord::pending("acc".to_string(), DateRange::new(0, 10), 7);
        assert_eq!(record.with_state(CoverageState::Ready).request_nonce(), Some(7));
        assert_eq!(record.with_state(CoverageState::Processed).request_nonce(), None);
    }
}
