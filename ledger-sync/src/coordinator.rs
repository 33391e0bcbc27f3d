//! Nonce-correlated range requests.
//!
//! A caller asks for items by id or by date range and receives a nonce. The coordinator
//! registers every id it expects as pending, matches delivered items against its open
//! requests, and completes a nonce exactly once when nothing is pending for it anymore.
//!
//! Registration and ingestion share one mutex, so an item can never be matched before the
//! pending row it resolves has been written.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{
    config::CoordinatorConfig,
    error::SyncError,
    interface::{FetchControl, ItemSink},
    primitives::{DateRange, ItemId, LedgerItem, Nonce},
    store::{KvStore, KvStoreExt, ScanOptions, Table, WriteBatch},
    task::{spawn_loop, LoopSignal, TaskHandle},
    utils,
};

mod completion;
pub mod request;
pub mod response;

use completion::CompletionRegistry;
use request::{PendingItem, RangeRequest, RequestParams, ResponseSlot, UNREGISTERED_ORDINAL};
use response::RangeResponse;

/// Longest wait of the completion sweep without a trigger.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn request_key(nonce: Nonce) -> Vec<u8> {
    Table::Request.key().u64(nonce).build()
}

fn pending_key(id: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::PendingItem.key().string(id)?.build())
}

fn pending_by_nonce_key(nonce: Nonce, id: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::PendingByNonce.key().u64(nonce).string(id)?.build())
}

fn pending_by_nonce_range(nonce: Nonce) -> (Vec<u8>, Vec<u8>) {
    Table::PendingByNonce.key().u64(nonce).prefix_range()
}

pub(crate) fn slot_key(id: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::ResponseSlot.key().string(id)?.build())
}

fn response_index_key(nonce: Nonce, ordinal: u64, id: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::ResponseIndex
        .key()
        .u64(nonce)
        .u64(ordinal)
        .string(id)?
        .build())
}

pub(crate) fn response_index_range(nonce: Nonce) -> (Vec<u8>, Vec<u8>) {
    Table::ResponseIndex.key().u64(nonce).prefix_range()
}

struct CoordinatorState {
    /// incomplete requests
    open: BTreeMap<Nonce, RangeRequest>,
    /// requests still enumerating their ids, which must not complete yet
    registering: HashSet<Nonce>,
    last_nonce: Nonce,
    registry: CompletionRegistry,
}

impl CoordinatorState {
    // wall clock based, strictly increasing even within one millisecond
    fn next_nonce(&mut self) -> Nonce {
        let candidate = utils::now_millis().saturating_mul(1000);
        self.last_nonce = candidate.max(self.last_nonce + 1);
        self.last_nonce
    }
}

struct CoordinatorInner {
    store: Arc<dyn KvStore>,
    fetch: Arc<dyn FetchControl>,
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    sweep_requested: AtomicBool,
    sweep_wake: Arc<Notify>,
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// stale pending rows whose slot was already filled
    pub repaired: usize,
    /// ids asked from the fetch subsystem again
    pub refetched: usize,
}

/// Tracks open range requests and their outstanding items.
#[derive(Clone)]
pub struct RangeRequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RangeRequestCoordinator {
    /// Loads the open requests from `store`.
    pub async fn load(
        store: Arc<dyn KvStore>,
        fetch: Arc<dyn FetchControl>,
        config: CoordinatorConfig,
    ) -> Result<Self, SyncError> {
        let (start, end) = Table::Request.key().prefix_range();
        let requests = store
            .scan_json::<RangeRequest>(&start, &end, ScanOptions::default())
            .await?;
        let last_nonce = requests
            .last()
            .map(|(_, request)| request.nonce())
            .unwrap_or_default();
        let open: BTreeMap<Nonce, RangeRequest> = requests
            .into_iter()
            .filter(|(_, request)| !request.complete())
            .map(|(_, request)| (request.nonce(), request))
            .collect();
        if !open.is_empty() {
            tracing::info!("loaded {} open range requests", open.len());
        }

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                store,
                fetch,
                config,
                state: Mutex::new(CoordinatorState {
                    open,
                    registering: HashSet::new(),
                    last_nonce,
                    registry: CompletionRegistry::default(),
                }),
                sweep_requested: AtomicBool::new(false),
                sweep_wake: Arc::new(Notify::new()),
            }),
        })
    }

    pub(crate) fn store(&self) -> Arc<dyn KvStore> {
        self.inner.store.clone()
    }

    pub(crate) fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Requests the items of `ids`. Complete at once if `ids` is empty.
    pub async fn fetch_by_ids(&self, ids: Vec<ItemId>) -> Result<Nonce, SyncError> {
        self.open_request(RequestParams::by_ids(ids)).await
    }

    /// Requests every item of `account` timestamped within `range`.
    pub async fn fetch_by_date_range(
        &self,
        account: &str,
        range: DateRange,
    ) -> Result<Nonce, SyncError> {
        self.open_request(RequestParams::ByDateRange {
            account: account.to_string(),
            range,
        })
        .await
    }

    async fn open_request(&self, params: RequestParams) -> Result<Nonce, SyncError> {
        let nonce = {
            let mut state = self.inner.state.lock().await;
            let nonce = state.next_nonce();
            let request = RangeRequest::new(nonce, params.clone(), utils::now_millis());
            self.inner
                .store
                .put_json(request_key(nonce), &request)
                .await?;
            state.open.insert(nonce, request);
            state.registering.insert(nonce);
            nonce
        };
        tracing::debug!("opened range request {} for {}", nonce, params);

        let registered = self.register_ids(nonce, &params).await;

        let mut state = self.inner.state.lock().await;
        state.registering.remove(&nonce);
        match registered {
            Ok(count) => {
                tracing::debug!("range request {} expects {} items", nonce, count);
                self.complete_if_done(&mut state, nonce).await?;
                Ok(nonce)
            }
            Err(e) => {
                drop(state);
                tracing::warn!("failed to register range request {}. {}", nonce, e);
                self.remove_request(nonce, WriteBatch::new()).await?;
                Err(e)
            }
        }
    }

    async fn register_ids(&self, nonce: Nonce, params: &RequestParams) -> Result<u64, SyncError> {
        let mut batches = params.id_batches(self.inner.fetch.as_ref()).await?;
        let mut next_ordinal = 0;
        while let Some(ids) = batches.next().await {
            let ids = ids?;
            if ids.is_empty() {
                continue;
            }
            let to_fetch = {
                let _state = self.inner.state.lock().await;
                self.register_batch(nonce, ids, &mut next_ordinal).await?
            };
            if !to_fetch.is_empty() {
                self.inner.fetch.fetch_by_ids(to_fetch).await?;
            }
        }
        Ok(next_ordinal)
    }

    /// Writes pending rows and slot placeholders for `ids`. Must be called holding the
    /// state lock. Returns the ids whose payload is still missing.
    async fn register_batch(
        &self,
        nonce: Nonce,
        ids: Vec<ItemId>,
        next_ordinal: &mut u64,
    ) -> Result<Vec<ItemId>, SyncError> {
        let store = self.inner.store.as_ref();
        let mut batch = WriteBatch::new();
        let mut seen = HashSet::new();
        let mut to_fetch = Vec::new();

        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            let key = slot_key(&id)?;
            let mut slot = store
                .get_json::<ResponseSlot>(&key)
                .await?
                .unwrap_or_else(|| ResponseSlot::new(id.clone()));
            match slot.nonce_indexes.get(&nonce).copied() {
                // ingestion matched the item before it was registered
                Some(UNREGISTERED_ORDINAL) => {
                    batch.delete(response_index_key(nonce, UNREGISTERED_ORDINAL, &id)?);
                }
                Some(_) => continue,
                None => (),
            }

            let ordinal = *next_ordinal;
            *next_ordinal += 1;
            slot.nonce_indexes.insert(nonce, ordinal);
            batch.put(response_index_key(nonce, ordinal, &id)?, &id)?;

            if slot.payload.is_none() {
                let pending_key = pending_key(&id)?;
                let mut pending = store
                    .get_json::<PendingItem>(&pending_key)
                    .await?
                    .unwrap_or_else(|| PendingItem::new(id.clone()));
                pending.nonces.insert(nonce);
                batch.put(pending_key, &pending)?;
                batch.put(pending_by_nonce_key(nonce, &id)?, &id)?;
                to_fetch.push(id.clone());
            }
            batch.put(key, &slot)?;
        }

        store.write(batch).await?;
        Ok(to_fetch)
    }

    /// Matches delivered items against every open request, returning the number of slots
    /// filled.
    pub async fn ingest_items(&self, items: Vec<LedgerItem>) -> Result<usize, SyncError> {
        let mut filled = 0;
        {
            let state = self.inner.state.lock().await;
            if state.open.is_empty() {
                return Ok(0);
            }
            let store = self.inner.store.as_ref();

            for item in items {
                let matching: Vec<Nonce> = state
                    .open
                    .values()
                    .filter(|request| request.params().matches(&item))
                    .map(RangeRequest::nonce)
                    .collect();
                if matching.is_empty() {
                    continue;
                }

                let id = item.id().clone();
                let key = slot_key(&id)?;
                let pending_key = pending_key(&id)?;
                let mut slot = store
                    .get_json::<ResponseSlot>(&key)
                    .await?
                    .unwrap_or_else(|| ResponseSlot::new(id.clone()));
                let mut pending = store.get_json::<PendingItem>(&pending_key).await?;
                let mut batch = WriteBatch::new();

                for nonce in matching {
                    if !slot.nonce_indexes.contains_key(&nonce) {
                        slot.nonce_indexes.insert(nonce, UNREGISTERED_ORDINAL);
                        batch.put(response_index_key(nonce, UNREGISTERED_ORDINAL, &id)?, &id)?;
                    }
                    if let Some(pending) = pending.as_mut() {
                        if pending.nonces.remove(&nonce) {
                            batch.delete(pending_by_nonce_key(nonce, &id)?);
                        }
                    }
                    filled += 1;
                }
                match pending {
                    Some(pending) if pending.nonces.is_empty() => batch.delete(pending_key),
                    Some(pending) => batch.put(pending_key, &pending)?,
                    None => (),
                }
                slot.payload = Some(item);
                batch.put(key, &slot)?;
                store.write(batch).await?;
            }
        }

        if filled > 0 {
            self.trigger_sweep();
        }
        Ok(filled)
    }

    /// Schedules a completion sweep. Triggers arriving while one is scheduled coalesce.
    pub fn trigger_sweep(&self) {
        if !self.inner.sweep_requested.swap(true, Ordering::SeqCst) {
            self.inner.sweep_wake.notify_one();
        }
    }

    /// Completes every open request with no pending items, returning their nonces.
    pub async fn check_completions(&self) -> Result<Vec<Nonce>, SyncError> {
        let mut state = self.inner.state.lock().await;
        let nonces: Vec<Nonce> = state.open.keys().copied().collect();
        let mut completed = Vec::new();
        for nonce in nonces {
            if self.complete_if_done(&mut state, nonce).await? {
                completed.push(nonce);
            }
        }
        Ok(completed)
    }

    async fn complete_if_done(
        &self,
        state: &mut CoordinatorState,
        nonce: Nonce,
    ) -> Result<bool, SyncError> {
        if state.registering.contains(&nonce) {
            return Ok(false);
        }
        let Some(request) = state.open.get(&nonce) else {
            return Ok(false);
        };
        let (start, end) = pending_by_nonce_range(nonce);
        let pending = self
            .inner
            .store
            .get_all_from_to(&start, &end, ScanOptions::limit(1))
            .await?;
        if !pending.is_empty() {
            return Ok(false);
        }

        let mut request = request.clone();
        request.complete = true;
        self.inner
            .store
            .put_json(request_key(nonce), &request)
            .await?;
        state.open.remove(&nonce);
        state.registry.resolve(nonce);
        tracing::debug!("range request {} complete", nonce);
        Ok(true)
    }

    async fn load_request(&self, nonce: Nonce) -> Result<RangeRequest, SyncError> {
        self.inner
            .store
            .get_json::<RangeRequest>(&request_key(nonce))
            .await?
            .ok_or(SyncError::UnknownNonce(nonce))
    }

    pub async fn is_complete(&self, nonce: Nonce) -> Result<bool, SyncError> {
        let _state = self.inner.state.lock().await;
        Ok(self.load_request(nonce).await?.complete())
    }

    /// Suspends until `nonce` completes.
    pub async fn await_complete(&self, nonce: Nonce) -> Result<(), SyncError> {
        let mut waiter = {
            let mut state = self.inner.state.lock().await;
            if self.load_request(nonce).await?.complete() {
                return Ok(());
            }
            state.registry.waiter(nonce)
        };
        waiter
            .wait_for(|done| *done)
            .await
            .map_err(|_| SyncError::CoordinatorStopped(nonce))?;
        Ok(())
    }

    /// Receives the nonce of every request completing from now on.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<Nonce> {
        self.inner.state.lock().await.registry.subscribe()
    }

    /// Waits for `nonce` to complete and returns its response.
    pub async fn get_response(&self, nonce: Nonce) -> Result<RangeResponse, SyncError> {
        self.await_complete(nonce).await?;
        let request = self.load_request(nonce).await?;
        Ok(RangeResponse::new(self.clone(), request))
    }

    /// Deletes a request, its pending rows and its response index, releasing shared slots.
    /// The writes of `batch` are applied in the same atomic write.
    pub(crate) async fn remove_request(
        &self,
        nonce: Nonce,
        mut batch: WriteBatch,
    ) -> Result<(), SyncError> {
        let mut state = self.inner.state.lock().await;
        let store = self.inner.store.as_ref();
        batch.delete(request_key(nonce));

        let (start, end) = response_index_range(nonce);
        for (key, id) in store
            .scan_json::<ItemId>(&start, &end, ScanOptions::default())
            .await?
        {
            batch.delete(key);
            let slot_key = slot_key(&id)?;
            if let Some(mut slot) = store.get_json::<ResponseSlot>(&slot_key).await? {
                slot.nonce_indexes.remove(&nonce);
                if slot.nonce_indexes.is_empty() {
                    batch.delete(slot_key);
                } else {
                    batch.put(slot_key, &slot)?;
                }
            }
        }

        let (start, end) = pending_by_nonce_range(nonce);
        for (key, id) in store
            .scan_json::<ItemId>(&start, &end, ScanOptions::default())
            .await?
        {
            batch.delete(key);
            let pending_key = pending_key(&id)?;
            if let Some(mut pending) = store.get_json::<PendingItem>(&pending_key).await? {
                pending.nonces.remove(&nonce);
                if pending.nonces.is_empty() {
                    batch.delete(pending_key);
                } else {
                    batch.put(pending_key, &pending)?;
                }
            }
        }

        store.write(batch).await?;
        state.open.remove(&nonce);
        state.registry.abandon(nonce);
        tracing::debug!("removed range request {}", nonce);
        Ok(())
    }

    /// Repairs requests open for longer than `retry_after`: pending rows whose slot is
    /// already filled are removed, the other ids are asked for again in batches.
    pub async fn retry_pending(&self) -> Result<RetrySummary, SyncError> {
        let threshold = utils::now_millis()
            .saturating_sub(utils::millis(self.inner.config.retry_after));
        let stale: Vec<Nonce> = {
            let state = self.inner.state.lock().await;
            state
                .open
                .values()
                .filter(|request| {
                    request.created_at() <= threshold
                        && !state.registering.contains(&request.nonce())
                })
                .map(RangeRequest::nonce)
                .collect()
        };

        let mut summary = RetrySummary::default();
        let mut refetch: Vec<ItemId> = Vec::new();
        for nonce in stale {
            let state = self.inner.state.lock().await;
            if !state.open.contains_key(&nonce) {
                continue;
            }
            let store = self.inner.store.as_ref();
            let (start, end) = pending_by_nonce_range(nonce);
            let rows = store
                .scan_json::<ItemId>(&start, &end, ScanOptions::default())
                .await?;

            let mut batch = WriteBatch::new();
            for (key, id) in rows {
                let filled = store
                    .get_json::<ResponseSlot>(&slot_key(&id)?)
                    .await?
                    .is_some_and(|slot| slot.is_filled_for(nonce));
                if !filled {
                    refetch.push(id);
                    continue;
                }
                batch.delete(key);
                let pending_key = pending_key(&id)?;
                if let Some(mut pending) = store.get_json::<PendingItem>(&pending_key).await? {
                    pending.nonces.remove(&nonce);
                    if pending.nonces.is_empty() {
                        batch.delete(pending_key);
                    } else {
                        batch.put(pending_key, &pending)?;
                    }
                }
                summary.repaired += 1;
            }
            store.write(batch).await?;
            drop(state);
        }

        refetch.sort();
        refetch.dedup();
        summary.refetched = refetch.len();
        for chunk in refetch.chunks(self.inner.config.refetch_batch_size.max(1)) {
            self.inner.fetch.fetch_by_ids(chunk.to_vec()).await?;
        }

        if summary.repaired > 0 || summary.refetched > 0 {
            tracing::info!(
                "retry sweep repaired {} pending rows and refetched {} items",
                summary.repaired,
                summary.refetched
            );
            self.trigger_sweep();
        }
        Ok(summary)
    }

    /// Open requests, oldest first.
    pub async fn open_requests(&self) -> Vec<RangeRequest> {
        self.inner
            .state
            .lock()
            .await
            .open
            .values()
            .cloned()
            .collect()
    }

    async fn sweep_step(&self) -> Result<LoopSignal, SyncError> {
        if self.inner.sweep_requested.load(Ordering::SeqCst) {
            tokio::time::sleep(self.inner.config.sweep_debounce).await;
            self.inner.sweep_requested.store(false, Ordering::SeqCst);
        }
        self.check_completions().await?;
        Ok(LoopSignal::Again(IDLE_SWEEP_INTERVAL))
    }

    /// Starts the debounced completion sweep and the periodic retry sweep.
    pub fn start(&self) -> Vec<TaskHandle> {
        let sweeper = self.clone();
        let sweep = spawn_loop(
            "completion sweep",
            Some(self.inner.sweep_wake.clone()),
            self.inner.config.sweep_debounce,
            move || {
                let coordinator = sweeper.clone();
                async move { coordinator.sweep_step().await }
            },
        );

        let retrier = self.clone();
        let retry_interval = self.inner.config.retry_interval;
        let retry = spawn_loop("pending retry sweep", None, retry_interval, move || {
            let coordinator = retrier.clone();
            async move {
                coordinator.retry_pending().await?;
                Ok(LoopSignal::Again(retry_interval))
            }
        });

        vec![sweep, retry]
    }
}

#[async_trait]
impl ItemSink for RangeRequestCoordinator {
    async fn ingest(&self, items: Vec<LedgerItem>) -> Result<usize, SyncError> {
        self.ingest_items(items).await
    }

    async fn is_awaited(&self, id: &ItemId) -> Result<bool, SyncError> {
        Ok(self.inner.store.exists(&pending_key(id)?).await?)
    }
}
