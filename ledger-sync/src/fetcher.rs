//! The fetch subsystem: tracked accounts, the item index and payload delivery.
//!
//! Cursor jobs deposit the items they observe into the `(account, timestamp, id)` index and
//! the delivery queue. The queue handler resolves payloads, from cache or the remote ledger,
//! and hands them to the [`ItemSink`].

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use ledger_status::{job_direction::JobDirection, rpc_tier::RpcTier};

use crate::{
    client::LedgerClients,
    config::{QueueConfig, SchedulerConfig},
    error::SyncError,
    interface::{FetchControl, IdBatchStream, ItemSink},
    primitives::{AccountState, DateRange, ItemId, ItemRef, LedgerItem, PaginationCursor},
    queue::{DurableWorkQueue, WorkHandler, WorkItem},
    scheduler::{load_job_state, CursorJobScheduler, JobContext, JobSink},
    store::{KvStore, KvStoreExt, ScanOptions, Table, WriteBatch},
    task::TaskHandle,
};

const DELIVERY_QUEUE: &str = "deliveries";

fn tracked_key(account: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::TrackedAccount.key().string(account)?.build())
}

fn item_ref_key(item: &ItemRef) -> Result<Vec<u8>, SyncError> {
    Ok(Table::ItemRef
        .key()
        .string(item.account())?
        .u64(item.timestamp())
        .string(item.id())?
        .build())
}

fn item_ref_by_id_key(id: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::ItemRefById.key().string(id)?.build())
}

fn payload_key(id: &str) -> Result<Vec<u8>, SyncError> {
    Ok(Table::Payload.key().string(id)?.build())
}

fn index_item(batch: &mut WriteBatch, item: &ItemRef) -> Result<(), SyncError> {
    batch.put(item_ref_key(item)?, item)?;
    batch.put(item_ref_by_id_key(item.id())?, item)?;
    Ok(())
}

struct FetcherInner {
    store: Arc<dyn KvStore>,
    clients: LedgerClients,
    scheduler_config: SchedulerConfig,
    batch_size: usize,
    deliveries: DurableWorkQueue<ItemId>,
    schedulers: Mutex<HashMap<String, CursorJobScheduler>>,
    started: AtomicBool,
}

/// Owns the cursor jobs of every tracked account and the item index they fill.
#[derive(Clone)]
pub struct LedgerFetcher {
    inner: Arc<FetcherInner>,
}

impl LedgerFetcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        clients: LedgerClients,
        scheduler_config: SchedulerConfig,
        queue_config: QueueConfig,
    ) -> Self {
        let deliveries =
            DurableWorkQueue::new(DELIVERY_QUEUE, store.clone(), queue_config, |id: &ItemId| {
                id.clone()
            });
        Self {
            inner: Arc::new(FetcherInner {
                store,
                clients,
                scheduler_config,
                batch_size: queue_config.chunk_size.max(1),
                deliveries,
                schedulers: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn deliveries(&self) -> &DurableWorkQueue<ItemId> {
        &self.inner.deliveries
    }

    /// Every persisted tracked account.
    pub async fn tracked_accounts(&self) -> Result<Vec<String>, SyncError> {
        let (start, end) = Table::TrackedAccount.key().prefix_range();
        Ok(self
            .inner
            .store
            .scan_json::<String>(&start, &end, ScanOptions::default())
            .await?
            .into_iter()
            .map(|(_, account)| account)
            .collect())
    }

    async fn is_tracked(&self, account: &str) -> Result<bool, SyncError> {
        Ok(self.inner.store.exists(&tracked_key(account)?).await?)
    }

    fn job_context(&self) -> JobContext {
        JobContext::new(
            self.inner.store.clone(),
            self.inner.clients.clone(),
            Arc::new(self.clone()),
            self.inner.scheduler_config.clone(),
        )
    }

    async fn start_scheduler(&self, account: &str) {
        let mut schedulers = self.inner.schedulers.lock().await;
        if !schedulers.contains_key(account) {
            let scheduler = CursorJobScheduler::start(account, self.job_context());
            schedulers.insert(account.to_string(), scheduler);
        }
    }

    /// Starts the delivery queue and the cursor jobs of every persisted tracked account.
    pub async fn start(&self, sink: Arc<dyn ItemSink>) -> Result<TaskHandle, SyncError> {
        let handler = Arc::new(DeliveryHandler {
            store: self.inner.store.clone(),
            clients: self.inner.clients.clone(),
            sink,
        });
        let deliveries = self.inner.deliveries.start(handler);

        self.inner.started.store(true, Ordering::SeqCst);
        let accounts = self.tracked_accounts().await?;
        for account in &accounts {
            self.start_scheduler(account).await;
        }
        if !accounts.is_empty() {
            tracing::info!("resumed {} tracked accounts", accounts.len());
        }
        Ok(deliveries)
    }

    /// Stops every cursor job, waiting for in-flight runs.
    pub async fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let schedulers: Vec<CursorJobScheduler> = self
            .inner
            .schedulers
            .lock()
            .await
            .drain()
            .map(|(_, scheduler)| scheduler)
            .collect();
        for scheduler in schedulers {
            scheduler.stop_and_join().await;
        }
    }

    async fn oldest_indexed(&self, account: &str) -> Result<Option<ItemRef>, SyncError> {
        let (start, end) = Table::ItemRef.key().string(account)?.prefix_range();
        Ok(self
            .inner
            .store
            .scan_json::<ItemRef>(&start, &end, ScanOptions::limit(1))
            .await?
            .into_iter()
            .next()
            .map(|(_, item)| item))
    }
}

#[async_trait]
impl FetchControl for LedgerFetcher {
    async fn add_tracked_account(&self, account: &str) -> Result<(), SyncError> {
        if !self.is_tracked(account).await? {
            self.inner
                .store
                .put_json(tracked_key(account)?, &account.to_string())
                .await?;
            tracing::info!("tracking {}", account);
        }
        if self.inner.started.load(Ordering::SeqCst) {
            self.start_scheduler(account).await;
        }
        Ok(())
    }

    async fn remove_tracked_account(&self, account: &str) -> Result<(), SyncError> {
        let mut batch = WriteBatch::new();
        batch.delete(tracked_key(account)?);
        self.inner.store.write(batch).await?;

        let scheduler = self.inner.schedulers.lock().await.remove(account);
        if let Some(scheduler) = scheduler {
            scheduler.stop_and_join().await;
        }
        tracing::info!("stopped tracking {}", account);
        Ok(())
    }

    /// The fully indexed range runs from the oldest indexed item up to the forward job's
    /// cursor. Items sharing the cursor's timestamp may still land after it, so that
    /// timestamp is excluded. Until history is complete the oldest timestamp may still have
    /// unindexed siblings, so it is excluded too.
    async fn get_state(&self, account: &str) -> Result<Option<AccountState>, SyncError> {
        if !self.is_tracked(account).await? {
            return Ok(None);
        }
        let store = self.inner.store.as_ref();
        let forward = load_job_state(store, account, JobDirection::Forward).await?;
        let backward = load_job_state(store, account, JobDirection::Backward).await?;
        let complete_history = backward.as_ref().is_some_and(|state| state.complete());

        let first_timestamp = self.oldest_indexed(account).await?.map(|item| {
            if complete_history {
                item.timestamp()
            } else {
                item.timestamp() + 1
            }
        });
        let last_timestamp = forward
            .as_ref()
            .and_then(|state| state.cursor().as_ref())
            .and_then(|cursor| cursor.timestamp().checked_sub(1));

        Ok(Some(AccountState {
            first_timestamp,
            last_timestamp,
            complete_history,
            forward: forward.as_ref().map(|state| state.snapshot()),
            backward: backward.as_ref().map(|state| state.snapshot()),
        }))
    }

    async fn fetch_by_ids(&self, ids: Vec<ItemId>) -> Result<(), SyncError> {
        self.inner.deliveries.add_work(ids).await?;
        Ok(())
    }

    async fn fetch_by_date_range(
        &self,
        account: &str,
        range: DateRange,
    ) -> Result<IdBatchStream, SyncError> {
        let start = Table::ItemRef
            .key()
            .string(account)?
            .u64(range.start())
            .build();
        let end = Table::ItemRef.key().string(account)?.u64(range.end()).build();
        let store = self.inner.store.clone();
        let batch_size = self.inner.batch_size;

        Ok(futures::stream::try_unfold(Some(start), move |cursor| {
            let store = store.clone();
            let end = end.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, SyncError>(None);
                };
                let rows = store
                    .scan_json::<ItemRef>(&cursor, &end, ScanOptions::limit(batch_size))
                    .await?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let next = if rows.len() < batch_size {
                    None
                } else {
                    rows.last().map(|(key, _)| {
                        let mut successor = key.clone();
                        successor.push(0);
                        successor
                    })
                };
                let ids = rows.into_iter().map(|(_, item)| item.id().clone()).collect();
                Ok(Some((ids, next)))
            }
        })
        .boxed())
    }
}

#[async_trait]
impl JobSink for LedgerFetcher {
    async fn deposit(&self, account: &str, items: Vec<ItemRef>) -> Result<(), SyncError> {
        let mut batch = WriteBatch::new();
        for item in &items {
            index_item(&mut batch, item)?;
        }
        self.inner.store.write(batch).await?;

        let added = self
            .inner
            .deliveries
            .add_work(items.into_iter().map(|item| item.id().clone()).collect())
            .await?;
        tracing::debug!("indexed items of {}, {} new deliveries", account, added);
        Ok(())
    }

    async fn oldest_known(&self, account: &str) -> Result<Option<PaginationCursor>, SyncError> {
        Ok(self.oldest_indexed(account).await?.map(|item| item.cursor()))
    }
}

/// Resolves queued ids into payloads and hands them to the sink.
struct DeliveryHandler {
    store: Arc<dyn KvStore>,
    clients: LedgerClients,
    sink: Arc<dyn ItemSink>,
}

impl DeliveryHandler {
    async fn fetch_remote(&self, ids: &[ItemId]) -> Result<Vec<LedgerItem>, SyncError> {
        match self.clients.primary().fetch_items(ids).await {
            Ok(items) => Ok(items),
            Err(e) if self.clients.has_fallback() => {
                tracing::warn!("primary rpc failed to fetch items, trying fallback. {}", e);
                let fallback = self.clients.for_tier(RpcTier::Fallback)?;
                Ok(fallback.fetch_items(ids).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WorkHandler<ItemId> for DeliveryHandler {
    async fn handle(&self, chunk: Vec<WorkItem<ItemId>>) -> Result<Option<Duration>, SyncError> {
        let ids: Vec<ItemId> = chunk.into_iter().map(WorkItem::into_payload).collect();
        let keys = ids
            .iter()
            .map(|id| payload_key(id))
            .collect::<Result<Vec<_>, _>>()?;
        let cached = self.store.get_many(&keys).await?;

        let mut items = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for (id, bytes) in ids.iter().zip(cached) {
            match bytes {
                Some(bytes) => items.push(
                    serde_json::from_slice::<LedgerItem>(&bytes)
                        .map_err(crate::error::StoreError::from)?,
                ),
                None => missing.push(id.clone()),
            }
        }

        if !missing.is_empty() {
            let fetched = self.fetch_remote(&missing).await?;
            let returned: BTreeSet<&ItemId> = fetched.iter().map(LedgerItem::id).collect();
            let unknown = missing.iter().filter(|id| !returned.contains(id)).count();
            if unknown > 0 {
                tracing::warn!("remote ledger returned no payload for {} items", unknown);
            }

            let mut batch = WriteBatch::new();
            for item in &fetched {
                batch.put(payload_key(item.id())?, item)?;
                index_item(&mut batch, &item.item_ref())?;
            }
            self.store.write(batch).await?;
            items.extend(fetched);
        }

        if !items.is_empty() {
            self.sink.ingest(items).await?;
        }
        Ok(None)
    }

    async fn check_complete(&self, item: &WorkItem<ItemId>) -> Result<bool, SyncError> {
        let id = item.payload();
        Ok(self.store.exists(&payload_key(id)?).await? && !self.sink.is_awaited(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::{
        config::{CoverageConfig, SyncConfig},
        coordinator::RangeRequestCoordinator,
        coverage::CoverageTracker,
        mocks::{mock_item, mock_item_at, CollectingConsumer, MockLedger},
        scheduler::FetchJob,
        store::memory::MemoryStore,
        task::LoopSignal,
    };

    const ACCOUNT: &str = "acc";

    fn fetcher(ledger: Arc<MockLedger>) -> (LedgerFetcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = SyncConfig::default();
        let fetcher = LedgerFetcher::new(
            store.clone(),
            LedgerClients::new(ledger, None),
            config.scheduler,
            QueueConfig {
                chunk_size: 2,
                ..config.queue
            },
        );
        (fetcher, store)
    }

    fn refs(positions: &[u64]) -> Vec<ItemRef> {
        positions
            .iter()
            .map(|p| mock_item(ACCOUNT, *p).item_ref())
            .collect()
    }

    #[tokio::test]
    async fn deposits_are_indexed_by_timestamp() {
        let (fetcher, _) = fetcher(Arc::new(MockLedger::new()));
        fetcher.deposit(ACCOUNT, refs(&[5, 1, 3, 4])).await.unwrap();
        fetcher.deposit("other", vec![mock_item("other", 2).item_ref()]).await.unwrap();

        let batches: Vec<Vec<ItemId>> = fetcher
            .fetch_by_date_range(ACCOUNT, DateRange::new(1000, 5000))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            batches,
            vec![
                vec!["acc-1".to_string(), "acc-3".to_string()],
                vec!["acc-4".to_string()]
            ]
        );
        assert_eq!(
            fetcher.oldest_known(ACCOUNT).await.unwrap().map(|c| c.position()),
            Some(1)
        );
        assert_eq!(fetcher.deliveries().get_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn state_is_derived_from_the_index_and_job_cursors() {
        let (fetcher, _) = fetcher(Arc::new(MockLedger::new()));
        assert_eq!(fetcher.get_state(ACCOUNT).await.unwrap(), None);

        fetcher.add_tracked_account(ACCOUNT).await.unwrap();
        let state = fetcher.get_state(ACCOUNT).await.unwrap().unwrap();
        assert_eq!(state.available_range(), None);
        assert!(!state.complete_history);

        fetcher.deposit(ACCOUNT, refs(&[2, 3])).await.unwrap();
        let state = fetcher.get_state(ACCOUNT).await.unwrap().unwrap();
        assert_eq!(state.first_timestamp, Some(2001));
        assert_eq!(state.last_timestamp, None);

        assert_eq!(fetcher.tracked_accounts().await.unwrap(), vec![ACCOUNT.to_string()]);
        fetcher.remove_tracked_account(ACCOUNT).await.unwrap();
        assert_eq!(fetcher.get_state(ACCOUNT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn deliveries_use_cached_payloads_and_reach_the_sink() {
        let ledger = Arc::new(MockLedger::with_history(ACCOUNT, 1..=3));
        let (fetcher, store) = fetcher(ledger.clone());
        let coordinator = RangeRequestCoordinator::load(
            store.clone(),
            Arc::new(fetcher.clone()),
            Default::default(),
        )
        .await
        .unwrap();
        let handler = DeliveryHandler {
            store: store.clone(),
            clients: LedgerClients::new(ledger.clone(), None),
            sink: Arc::new(coordinator.clone()),
        };

        let nonce = coordinator
            .fetch_by_ids(vec!["acc-1".to_string(), "acc-2".to_string()])
            .await
            .unwrap();
        assert_eq!(fetcher.deliveries().get_count().await.unwrap(), 2);
        fetcher.deliveries().process_next(&handler).await.unwrap();
        assert_eq!(ledger.requested_ids(), vec!["acc-1", "acc-2"]);
        assert_eq!(coordinator.check_completions().await.unwrap(), vec![nonce]);
        assert_eq!(fetcher.deliveries().get_count().await.unwrap(), 0);

        // delivered ids are not fetched again
        let second = coordinator
            .fetch_by_ids(vec!["acc-2".to_string(), "acc-3".to_string()])
            .await
            .unwrap();
        fetcher.deliveries().process_next(&handler).await.unwrap();
        assert_eq!(ledger.item_calls(), 2);
        assert_eq!(ledger.requested_ids(), vec!["acc-1", "acc-2", "acc-3"]);
        assert_eq!(coordinator.check_completions().await.unwrap(), vec![second]);

        // cached payloads nobody waits for complete without a handler run
        fetcher.fetch_by_ids(vec!["acc-1".to_string()]).await.unwrap();
        fetcher.deliveries().process_next(&handler).await.unwrap();
        assert_eq!(ledger.item_calls(), 2);
        assert_eq!(fetcher.deliveries().get_count().await.unwrap(), 0);

        // fetched payloads are indexed for date range requests
        let batches: Vec<Vec<ItemId>> = fetcher
            .fetch_by_date_range(ACCOUNT, DateRange::new(0, 10_000))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches.concat(), vec!["acc-1", "acc-2", "acc-3"]);
    }

    #[tokio::test]
    async fn failed_item_fetches_stay_queued() {
        let ledger = Arc::new(MockLedger::with_history(ACCOUNT, 1..=2));
        let (fetcher, store) = fetcher(ledger.clone());
        let coordinator = RangeRequestCoordinator::load(
            store.clone(),
            Arc::new(fetcher.clone()),
            Default::default(),
        )
        .await
        .unwrap();
        let handler = DeliveryHandler {
            store: store.clone(),
            clients: LedgerClients::new(ledger.clone(), None),
            sink: Arc::new(coordinator.clone()),
        };
        coordinator
            .fetch_by_ids(vec!["acc-1".to_string()])
            .await
            .unwrap();
        ledger.fail_items_next(crate::error::ServerError::RequestFailed("down".to_string()));

        assert!(fetcher.deliveries().process_next(&handler).await.is_err());
        assert_eq!(fetcher.deliveries().get_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn started_fetcher_indexes_tracked_history() {
        let ledger = Arc::new(MockLedger::with_history(ACCOUNT, 1..=30));
        let store = Arc::new(MemoryStore::new());
        let mut config = SyncConfig::default();
        config.scheduler.page_limit = 10;
        config.scheduler.page_retry.min_page_items = 1;
        config.scheduler.backward_interval = Duration::from_millis(5);
        config.scheduler.defer_delay = Duration::from_millis(5);
        config.queue.idle_delay = Duration::from_millis(5);
        let fetcher = LedgerFetcher::new(
            store.clone(),
            LedgerClients::new(ledger.clone(), None),
            config.scheduler,
            config.queue,
        );
        let coordinator =
            RangeRequestCoordinator::load(store, Arc::new(fetcher.clone()), config.coordinator)
                .await
                .unwrap();
        let deliveries = fetcher.start(Arc::new(coordinator)).await.unwrap();
        fetcher.add_tracked_account(ACCOUNT).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = fetcher.get_state(ACCOUNT).await.unwrap().unwrap();
                if state.complete_history {
                    break state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(state.available_range(), Some(DateRange::new(1000, 30_000)));

        fetcher.stop().await;
        deliveries.stop_and_join().await;
    }

    async fn deliver_and_process(
        fetcher: &LedgerFetcher,
        handler: &DeliveryHandler,
        coordinator: &RangeRequestCoordinator,
        tracker: &CoverageTracker,
    ) {
        while fetcher.deliveries().get_count().await.unwrap() > 0 {
            fetcher.deliveries().process_next(handler).await.unwrap();
        }
        for nonce in coordinator.check_completions().await.unwrap() {
            tracker.on_request_complete(nonce).await.unwrap();
        }
        tracker.recover().await.unwrap();
        tracker.process_ready().await.unwrap();
    }

    #[tokio::test]
    async fn items_sharing_the_cursor_timestamp_are_not_skipped() {
        let ledger = Arc::new(MockLedger::new());
        ledger.push_items(vec![
            mock_item_at("acc-1", ACCOUNT, 1, 1000),
            mock_item_at("acc-2", ACCOUNT, 2, 2000),
        ]);
        let store = Arc::new(MemoryStore::new());
        let mut config = SyncConfig::default();
        config.scheduler.page_retry.min_page_items = 1;
        let fetcher = LedgerFetcher::new(
            store.clone(),
            LedgerClients::new(ledger.clone(), None),
            config.scheduler,
            config.queue,
        );
        let coordinator = RangeRequestCoordinator::load(
            store.clone(),
            Arc::new(fetcher.clone()),
            config.coordinator,
        )
        .await
        .unwrap();
        let handler = DeliveryHandler {
            store: store.clone(),
            clients: LedgerClients::new(ledger.clone(), None),
            sink: Arc::new(coordinator.clone()),
        };
        let consumer = Arc::new(CollectingConsumer::new());
        let tracker = CoverageTracker::new(
            ACCOUNT,
            store.clone(),
            coordinator.clone(),
            Arc::new(fetcher.clone()),
            consumer.clone(),
            CoverageConfig::default(),
        );
        fetcher.add_tracked_account(ACCOUNT).await.unwrap();
        let (forward, _first_run) = FetchJob::forward(ACCOUNT, fetcher.job_context());
        let backward = FetchJob::backward(ACCOUNT, fetcher.job_context(), None);

        forward.run_forward().await.unwrap();
        assert_eq!(backward.run_backward().await.unwrap(), LoopSignal::Stop);
        let state = fetcher.get_state(ACCOUNT).await.unwrap().unwrap();
        assert_eq!(state.available_range(), Some(DateRange::new(1000, 2000)));
        tracker.fetch_tick().await.unwrap();
        deliver_and_process(&fetcher, &handler, &coordinator, &tracker).await;

        // acc-3 lands after the cursor, at the cursor's timestamp
        ledger.push_items(vec![
            mock_item_at("acc-3", ACCOUNT, 3, 2000),
            mock_item_at("acc-4", ACCOUNT, 4, 3000),
        ]);
        forward.run_forward().await.unwrap();
        tracker.fetch_tick().await.unwrap();
        deliver_and_process(&fetcher, &handler, &coordinator, &tracker).await;

        let consumed = consumer.consumed();
        assert_eq!(
            consumed.iter().map(|range| range.range).collect::<Vec<_>>(),
            vec![DateRange::new(1000, 2000), DateRange::new(2000, 3000)]
        );
        assert_eq!(
            consumed
                .into_iter()
                .flat_map(|range| range.ids)
                .collect::<Vec<_>>(),
            vec!["acc-1", "acc-2", "acc-3"]
        );
    }
}
