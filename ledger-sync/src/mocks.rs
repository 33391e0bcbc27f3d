//! Test doubles for the collaborators of the sync engine.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};

use crate::{
    client::{Page, PageRequest, RemoteLedger},
    error::{ServerError, StoreError, SyncError},
    interface::{DateRangeBatch, FetchControl, IdBatchStream, RangeConsumer},
    primitives::{AccountState, DateRange, ItemId, ItemRef, LedgerItem, PaginationCursor},
    scheduler::JobSink,
    store::{memory::MemoryStore, BatchOp, KeyValue, KvStore, ScanOptions},
};

/// A ledger item of `account` at `position`, timestamped `position * 1000`.
pub fn mock_item(account: &str, position: u64) -> LedgerItem {
    mock_item_at(&format!("{account}-{position}"), account, position, position * 1000)
}

/// A ledger item with an explicit id and timestamp, for items sharing a position or a
/// timestamp.
pub fn mock_item_at(id: &str, account: &str, position: u64, timestamp: u64) -> LedgerItem {
    LedgerItem::from_parts(
        id.to_string(),
        account.to_string(),
        position,
        timestamp,
        serde_json::json!({ "position": position }),
    )
}

#[derive(Default)]
struct MockLedgerState {
    history: BTreeMap<String, Vec<LedgerItem>>,
    short_pages: VecDeque<usize>,
    page_failures: VecDeque<ServerError>,
    item_failures: VecDeque<ServerError>,
    requested_ids: Vec<ItemId>,
}

/// In-memory remote ledger.
///
/// History is served newest first. Items sharing a position are ordered by insertion, the
/// later one being newer. `before` excludes its own item and everything newer. `until` is
/// honoured inclusively, so the until item itself is returned again, as unreliable servers
/// do. Cursors naming an unknown id fall back to their position.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockLedgerState>,
    page_calls: AtomicUsize,
    item_calls: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(account: &str, positions: impl IntoIterator<Item = u64>) -> Self {
        let ledger = Self::new();
        ledger.push_history(account, positions);
        ledger
    }

    pub fn push_history(&self, account: &str, positions: impl IntoIterator<Item = u64>) {
        self.push_items(positions.into_iter().map(|p| mock_item(account, p)).collect());
    }

    pub fn push_items(&self, items: Vec<LedgerItem>) {
        let mut state = self.state.lock().unwrap();
        for item in items {
            let history = state.history.entry(item.account().clone()).or_default();
            history.retain(|existing| existing.id() != item.id());
            history.push(item);
            history.sort_by_key(LedgerItem::position);
        }
    }

    pub fn cursor_at(&self, account: &str, position: u64) -> PaginationCursor {
        mock_item(account, position).item_ref().cursor()
    }

    /// The next page returned holds at most `max_items` items.
    pub fn short_next(&self, max_items: usize) {
        self.state.lock().unwrap().short_pages.push_back(max_items);
    }

    /// The next page request fails with `error`.
    pub fn fail_next(&self, error: ServerError) {
        self.state.lock().unwrap().page_failures.push_back(error);
    }

    /// The next item request fails with `error`.
    pub fn fail_items_next(&self, error: ServerError) {
        self.state.lock().unwrap().item_failures.push_back(error);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn item_calls(&self) -> usize {
        self.item_calls.load(Ordering::SeqCst)
    }

    /// Every id requested through `fetch_items`, in request order.
    pub fn requested_ids(&self) -> Vec<ItemId> {
        self.state.lock().unwrap().requested_ids.clone()
    }
}

#[async_trait]
impl RemoteLedger for MockLedger {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, ServerError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.page_failures.pop_front() {
            return Err(error);
        }

        let mut limit = request.limit;
        if let Some(max_items) = state.short_pages.pop_front() {
            limit = limit.min(max_items);
        }
        let newest_first: Vec<&LedgerItem> = state
            .history
            .get(&request.address)
            .map(|history| history.iter().rev().collect())
            .unwrap_or_default();
        let start = match &request.before {
            Some(before) => newest_first
                .iter()
                .position(|item| item.id() == before.id())
                .map(|index| index + 1)
                .or_else(|| {
                    newest_first
                        .iter()
                        .position(|item| item.position() < before.position())
                })
                .unwrap_or(newest_first.len()),
            None => 0,
        };

        let mut items = Vec::new();
        for item in &newest_first[start..] {
            if items.len() == limit {
                break;
            }
            if let Some(until) = &request.until {
                if item.position() < until.position() {
                    break;
                }
            }
            items.push(item.item_ref());
            if request
                .until
                .as_ref()
                .is_some_and(|until| until.id() == item.id())
            {
                break;
            }
        }

        Ok(Page::from_items(items))
    }

    async fn fetch_items(&self, ids: &[ItemId]) -> Result<Vec<LedgerItem>, ServerError> {
        self.item_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.item_failures.pop_front() {
            return Err(error);
        }
        state.requested_ids.extend(ids.iter().cloned());

        let wanted: BTreeSet<&ItemId> = ids.iter().collect();
        Ok(state
            .history
            .values()
            .flatten()
            .filter(|item| wanted.contains(item.id()))
            .cloned()
            .collect())
    }
}

/// In-memory storage whose next atomic write can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    rows: MemoryStore,
    fail_next: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `apply` fails without writing anything.
    pub fn fail_next_write(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.rows.get(key).await
    }

    async fn apply(&self, batch: Vec<BatchOp>) -> Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        self.rows.apply(batch).await
    }

    async fn get_all_from_to(
        &self,
        start: &[u8],
        end: &[u8],
        options: ScanOptions,
    ) -> Result<Vec<KeyValue>, StoreError> {
        self.rows.get_all_from_to(start, end, options).await
    }
}

/// Records what cursor jobs deposit.
#[derive(Default)]
pub struct RecordingJobSink {
    deposits: Mutex<Vec<ItemRef>>,
}

impl RecordingJobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposited(&self) -> Vec<ItemRef> {
        self.deposits.lock().unwrap().clone()
    }

    pub fn deposited_positions(&self) -> Vec<u64> {
        self.deposited().iter().map(ItemRef::position).collect()
    }
}

#[async_trait]
impl JobSink for RecordingJobSink {
    async fn deposit(&self, _account: &str, items: Vec<ItemRef>) -> Result<(), SyncError> {
        self.deposits.lock().unwrap().extend(items);
        Ok(())
    }

    async fn oldest_known(&self, account: &str) -> Result<Option<PaginationCursor>, SyncError> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .iter()
            .filter(|item| item.account() == account)
            .rev()
            .min_by_key(|item| item.position())
            .map(ItemRef::cursor))
    }
}

/// Fetch subsystem double with a fixed item index.
pub struct MockFetchControl {
    index: Mutex<Vec<ItemRef>>,
    states: Mutex<HashMap<String, AccountState>>,
    requested: Mutex<Vec<Vec<ItemId>>>,
    batch_size: usize,
}

impl MockFetchControl {
    pub fn new(batch_size: usize) -> Self {
        Self {
            index: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
        }
    }

    pub fn index_items(&self, items: &[LedgerItem]) {
        self.index
            .lock()
            .unwrap()
            .extend(items.iter().map(LedgerItem::item_ref));
    }

    pub fn set_state(&self, account: &str, state: AccountState) {
        self.states
            .lock()
            .unwrap()
            .insert(account.to_string(), state);
    }

    /// Every `fetch_by_ids` call, in call order.
    pub fn requested(&self) -> Vec<Vec<ItemId>> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchControl for MockFetchControl {
    async fn add_tracked_account(&self, account: &str) -> Result<(), SyncError> {
        self.states
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_insert(AccountState {
                first_timestamp: None,
                last_timestamp: None,
                complete_history: false,
                forward: None,
                backward: None,
            });
        Ok(())
    }

    async fn remove_tracked_account(&self, account: &str) -> Result<(), SyncError> {
        self.states.lock().unwrap().remove(account);
        Ok(())
    }

    async fn get_state(&self, account: &str) -> Result<Option<AccountState>, SyncError> {
        Ok(self.states.lock().unwrap().get(account).cloned())
    }

    async fn fetch_by_ids(&self, ids: Vec<ItemId>) -> Result<(), SyncError> {
        self.requested.lock().unwrap().push(ids);
        Ok(())
    }

    async fn fetch_by_date_range(
        &self,
        account: &str,
        range: DateRange,
    ) -> Result<IdBatchStream, SyncError> {
        let mut matching: Vec<ItemRef> = self
            .index
            .lock()
            .unwrap()
            .iter()
            .filter(|item| item.account() == account && range.contains(item.timestamp()))
            .cloned()
            .collect();
        matching.sort_by_key(|item| (item.timestamp(), item.id().clone()));

        let batches: Vec<Result<Vec<ItemId>, SyncError>> = matching
            .chunks(self.batch_size)
            .map(|chunk| Ok(chunk.iter().map(|item| item.id().clone()).collect()))
            .collect();
        Ok(futures::stream::iter(batches).boxed())
    }
}

/// A range handed to [`CollectingConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRange {
    pub account: String,
    pub range: DateRange,
    pub ids: Vec<ItemId>,
}

/// Consumer collecting every range it is given.
#[derive(Default)]
pub struct CollectingConsumer {
    consumed: Mutex<Vec<ConsumedRange>>,
    skip_drain: bool,
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer that returns without reading the stream.
    pub fn non_draining() -> Self {
        Self {
            consumed: Mutex::new(Vec::new()),
            skip_drain: true,
        }
    }

    pub fn consumed(&self) -> Vec<ConsumedRange> {
        self.consumed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeConsumer for CollectingConsumer {
    async fn on_date_range(&self, batch: DateRangeBatch) -> Result<(), SyncError> {
        let DateRangeBatch {
            account,
            range,
            items,
        } = batch;
        let ids = if self.skip_drain {
            Vec::new()
        } else {
            items
                .map_ok(|item| item.id().clone())
                .try_collect::<Vec<_>>()
                .await?
        };
        self.consumed
            .lock()
            .unwrap()
            .push(ConsumedRange { account, range, ids });
        Ok(())
    }
}
