//! Traits for interfacing the sync engine's components with each other and with consumers

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::SyncError;
use crate::primitives::{AccountState, DateRange, ItemId, LedgerItem};

/// Lazy, finite sequence of matched payloads handed to a consumer.
pub type ResponseStream = BoxStream<'static, Result<LedgerItem, SyncError>>;

/// Lazy sequence of id batches matching a date range.
pub type IdBatchStream = BoxStream<'static, Result<Vec<ItemId>, SyncError>>;

/// Control surface of the fetch subsystem, which owns the cursor jobs and the item index.
#[async_trait]
pub trait FetchControl: Send + Sync {
    /// Starts indexing the history of `account`. Idempotent.
    async fn add_tracked_account(&self, account: &str) -> Result<(), SyncError>;

    /// Stops the account's cursor jobs. Indexed items are kept.
    async fn remove_tracked_account(&self, account: &str) -> Result<(), SyncError>;

    /// Returns `None` if the account is not tracked.
    async fn get_state(&self, account: &str) -> Result<Option<AccountState>, SyncError>;

    /// Asks for delivery of the payloads of `ids` to the item sink.
    async fn fetch_by_ids(&self, ids: Vec<ItemId>) -> Result<(), SyncError>;

    /// Returns the indexed ids of `account` whose timestamp lies in `range`, in batches.
    async fn fetch_by_date_range(
        &self,
        account: &str,
        range: DateRange,
    ) -> Result<IdBatchStream, SyncError>;
}

/// Receives delivered payloads. Implemented by the range request coordinator.
#[async_trait]
pub trait ItemSink: Send + Sync {
    /// Matches `items` against open requests, returning how many slots were filled.
    async fn ingest(&self, items: Vec<LedgerItem>) -> Result<usize, SyncError>;

    /// `true` while an open request still waits for `id`.
    async fn is_awaited(&self, id: &ItemId) -> Result<bool, SyncError>;
}

/// A date range of one account ready for consumption.
pub struct DateRangeBatch {
    pub account: String,
    pub range: DateRange,
    /// Must be drained before the range counts as processed.
    pub items: ResponseStream,
}

impl std::fmt::Debug for DateRangeBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DateRangeBatch")
            .field("account", &self.account)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// Downstream consumer of covered date ranges.
#[async_trait]
pub trait RangeConsumer: Send + Sync {
    async fn on_date_range(&self, batch: DateRangeBatch) -> Result<(), SyncError>;
}
