//! Date range coverage of one account.
//!
//! Ranges move from Pending (dispatched to the coordinator) to Ready (request complete) to
//! Processed (drained by the consumer). Only Processed ranges count as coverage, and they
//! are periodically compacted.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex, Notify};

use ledger_status::coverage_state::CoverageState;

use crate::{
    config::{CoverageConfig, MIN_INTERVAL},
    coordinator::RangeRequestCoordinator,
    error::SyncError,
    interface::{DateRangeBatch, FetchControl, RangeConsumer, ResponseStream},
    interval,
    primitives::{DateRange, JobSnapshot, LedgerItem, Nonce, RangeCoverageRecord},
    store::{KvStore, KvStoreExt, ScanOptions, Table, WriteBatch},
    task::{spawn_loop, LoopSignal, TaskHandle},
    utils,
};

fn record_key(record: &RangeCoverageRecord) -> Result<Vec<u8>, SyncError> {
    let range = record.range();
    Ok(Table::Coverage
        .key()
        .string(record.account())?
        .code(record.state().key_code())
        .u64(range.start())
        .u64(range.end())
        .build())
}

fn state_range(account: &str, state: CoverageState) -> Result<(Vec<u8>, Vec<u8>), SyncError> {
    Ok(Table::Coverage
        .key()
        .string(account)?
        .code(state.key_code())
        .prefix_range())
}

/// Health of a cursor job, as reported with the coverage progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHealth {
    pub last_run_at: Option<u64>,
    pub frequency_millis: u64,
    pub complete: bool,
    /// not run for several of its own intervals
    pub stalled: bool,
}

impl JobHealth {
    fn from_snapshot(snapshot: &JobSnapshot, now: u64, stall_factor: u64) -> Self {
        Self {
            last_run_at: snapshot.last_run_at,
            frequency_millis: snapshot.frequency_millis,
            complete: snapshot.complete,
            stalled: snapshot.is_stalled(now, stall_factor, utils::millis(MIN_INTERVAL)),
        }
    }
}

/// Coverage of an account's available history.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageProgress {
    /// processed share of the available range, 0 to 100
    pub percent: f64,
    pub processed_millis: u64,
    /// available but not processed yet, in flight or not
    pub pending_millis: u64,
    pub complete_history: bool,
    pub forward: Option<JobHealth>,
    pub backward: Option<JobHealth>,
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub written: usize,
    pub deleted: usize,
}

struct TrackerInner {
    account: String,
    store: Arc<dyn KvStore>,
    coordinator: RangeRequestCoordinator,
    fetch: Arc<dyn FetchControl>,
    consumer: Arc<dyn RangeConsumer>,
    config: CoverageConfig,
    /// serialises state transitions of this account's records
    transitions: Mutex<()>,
    ready_wake: Arc<Notify>,
}

/// Drives the coverage state machine of one account.
#[derive(Clone)]
pub struct CoverageTracker {
    inner: Arc<TrackerInner>,
}

impl CoverageTracker {
    pub fn new(
        account: &str,
        store: Arc<dyn KvStore>,
        coordinator: RangeRequestCoordinator,
        fetch: Arc<dyn FetchControl>,
        consumer: Arc<dyn RangeConsumer>,
        config: CoverageConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                account: account.to_string(),
                store,
                coordinator,
                fetch,
                consumer,
                config,
                transitions: Mutex::new(()),
                ready_wake: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn account(&self) -> &str {
        &self.inner.account
    }

    /// Every record of the account in `state`, in start order.
    pub async fn records(&self, state: CoverageState) -> Result<Vec<RangeCoverageRecord>, SyncError> {
        let (start, end) = state_range(&self.inner.account, state)?;
        Ok(self
            .inner
            .store
            .scan_json::<RangeCoverageRecord>(&start, &end, ScanOptions::default())
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<RangeCoverageRecord>, SyncError> {
        let (start, end) = Table::Coverage
            .key()
            .string(&self.inner.account)?
            .prefix_range();
        Ok(self
            .inner
            .store
            .scan_json::<RangeCoverageRecord>(&start, &end, ScanOptions::default())
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Moves `record` to `state` if it is still stored. Returns `false` when another loop
    /// already moved it.
    async fn transition(
        &self,
        record: &RangeCoverageRecord,
        state: CoverageState,
    ) -> Result<bool, SyncError> {
        let _guard = self.inner.transitions.lock().await;
        let old_key = record_key(record)?;
        if !self.inner.store.exists(&old_key).await? {
            return Ok(false);
        }
        let moved = record.with_state(state);
        let mut batch = WriteBatch::new();
        batch.delete(old_key);
        batch.put(record_key(&moved)?, &moved)?;
        self.inner.store.write(batch).await?;
        Ok(true)
    }

    async fn delete_record(&self, record: &RangeCoverageRecord) -> Result<(), SyncError> {
        let _guard = self.inner.transitions.lock().await;
        let mut batch = WriteBatch::new();
        batch.delete(record_key(record)?);
        self.inner.store.write(batch).await?;
        Ok(())
    }

    /// Reconciles Pending records left behind by a crash. Completed requests are promoted
    /// to Ready, records of vanished requests are dropped so their range is requested again.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let mut promoted = 0;
        for record in self.records(CoverageState::Pending).await? {
            let Some(nonce) = record.request_nonce() else {
                tracing::error!("pending coverage record {} has no nonce", record.range());
                self.delete_record(&record).await?;
                continue;
            };
            match self.inner.coordinator.is_complete(nonce).await {
                Ok(true) => {
                    if self.transition(&record, CoverageState::Ready).await? {
                        promoted += 1;
                    }
                }
                Ok(false) => (),
                Err(SyncError::UnknownNonce(_)) => {
                    tracing::warn!(
                        "request {} of {} {} is gone, range will be requested again",
                        nonce,
                        self.inner.account,
                        record.range()
                    );
                    self.delete_record(&record).await?;
                }
                Err(e) => return Err(e),
            }
        }
        if promoted > 0 {
            tracing::info!(
                "recovered {} completed ranges of {}",
                promoted,
                self.inner.account
            );
            self.inner.ready_wake.notify_one();
        }
        Ok(promoted)
    }

    /// Promotes the Pending records of `nonce` to Ready.
    pub async fn on_request_complete(&self, nonce: Nonce) -> Result<usize, SyncError> {
        let mut promoted = 0;
        for record in self.records(CoverageState::Pending).await? {
            if record.request_nonce() == Some(nonce)
                && self.transition(&record, CoverageState::Ready).await?
            {
                promoted += 1;
            }
        }
        if promoted > 0 {
            self.inner.ready_wake.notify_one();
        }
        Ok(promoted)
    }

    /// Dispatches the newest uncovered ranges, returning the dispatched ranges.
    pub async fn fetch_tick(&self) -> Result<Vec<DateRange>, SyncError> {
        let account = &self.inner.account;
        let state = self
            .inner
            .fetch
            .get_state(account)
            .await?
            .ok_or_else(|| SyncError::AccountNotTracked(account.clone()))?;
        let Some(available) = state.available_range() else {
            return Ok(Vec::new());
        };

        let records = self.all_records().await?;
        let gaps = interval::clip(&[available], records.iter().map(RangeCoverageRecord::range));

        let chunk = utils::millis(self.inner.config.chunk_timeframe).max(1);
        let mut dispatched = Vec::new();
        for gap in gaps.iter().rev().take(2) {
            let range = gap.newest(chunk);
            self.dispatch(range).await?;
            dispatched.push(range);
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, range: DateRange) -> Result<(), SyncError> {
        let account = &self.inner.account;
        let nonce = self
            .inner
            .coordinator
            .fetch_by_date_range(account, range)
            .await?;
        let record = RangeCoverageRecord::pending(account.clone(), range, nonce);
        {
            let _guard = self.inner.transitions.lock().await;
            self.inner
                .store
                .put_json(record_key(&record)?, &record)
                .await?;
        }
        tracing::debug!("requested {} {} with nonce {}", account, range, nonce);

        // the completion may have been published before the record existed
        if self.inner.coordinator.is_complete(nonce).await?
            && self.transition(&record, CoverageState::Ready).await?
        {
            self.inner.ready_wake.notify_one();
        }
        Ok(())
    }

    /// Hands every Ready range to the consumer and marks it Processed. Returns the number
    /// of ranges processed.
    pub async fn process_ready(&self) -> Result<usize, SyncError> {
        let mut processed = 0;
        for record in self.records(CoverageState::Ready).await? {
            let Some(nonce) = record.request_nonce() else {
                tracing::error!("ready coverage record {} has no nonce", record.range());
                self.delete_record(&record).await?;
                continue;
            };
            let response = match self.inner.coordinator.get_response(nonce).await {
                Ok(response) => response,
                Err(SyncError::UnknownNonce(_)) => {
                    tracing::error!(
                        "response of request {} for {} {} is missing, dropping the record",
                        nonce,
                        self.inner.account,
                        record.range()
                    );
                    self.delete_record(&record).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let drained = Arc::new(AtomicBool::new(false));
            let batch = DateRangeBatch {
                account: self.inner.account.clone(),
                range: record.range(),
                items: track_drain(response.stream(), drained.clone()),
            };
            self.inner.consumer.on_date_range(batch).await?;
            if !drained.load(Ordering::SeqCst) {
                return Err(SyncError::UndrainedResponse(nonce));
            }

            // the record and its request go in one write, a crash leaves neither orphaned
            let _guard = self.inner.transitions.lock().await;
            let old_key = record_key(&record)?;
            if !self.inner.store.exists(&old_key).await? {
                continue;
            }
            let moved = record.with_state(CoverageState::Processed);
            let mut batch = WriteBatch::new();
            batch.delete(old_key);
            batch.put(record_key(&moved)?, &moved)?;
            response.remove_with(batch).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Merges adjacent and overlapping Processed records.
    pub async fn compact(&self) -> Result<CompactionSummary, SyncError> {
        let _guard = self.inner.transitions.lock().await;
        let (start, end) = state_range(&self.inner.account, CoverageState::Processed)?;
        let processed: Vec<RangeCoverageRecord> = self
            .inner
            .store
            .scan_json::<RangeCoverageRecord>(&start, &end, ScanOptions::default())
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        let merged = interval::merge(processed);

        let mut batch = WriteBatch::new();
        for record in &merged.old_ranges {
            batch.delete(record_key(record)?);
        }
        for range in &merged.new_ranges {
            let record = RangeCoverageRecord::processed(self.inner.account.clone(), *range);
            batch.put(record_key(&record)?, &record)?;
        }
        self.inner.store.write(batch).await?;

        let summary = CompactionSummary {
            written: merged.new_ranges.len(),
            deleted: merged.old_ranges.len(),
        };
        if summary.deleted > 0 {
            tracing::debug!(
                "compacted {} coverage records of {} into {}",
                summary.deleted,
                self.inner.account,
                summary.written
            );
        }
        Ok(summary)
    }

    /// Coverage of the available history. Never blocks on a failing job: stalled jobs are
    /// reported as such.
    pub async fn progress(&self, stall_factor: u64) -> Result<CoverageProgress, SyncError> {
        let account = &self.inner.account;
        let state = self
            .inner
            .fetch
            .get_state(account)
            .await?
            .ok_or_else(|| SyncError::AccountNotTracked(account.clone()))?;
        let processed: Vec<DateRange> = self
            .records(CoverageState::Processed)
            .await?
            .iter()
            .map(RangeCoverageRecord::range)
            .collect();

        let (processed_millis, pending_millis) = match state.available_range() {
            Some(available) => {
                let pending = interval::clip(&[available], processed);
                let pending_millis = interval::total_duration(pending);
                (available.duration() - pending_millis, pending_millis)
            }
            None => (0, 0),
        };
        let total = processed_millis + pending_millis;
        let percent = if total == 0 {
            0.0
        } else {
            processed_millis as f64 * 100.0 / total as f64
        };

        let now = utils::now_millis();
        Ok(CoverageProgress {
            percent,
            processed_millis,
            pending_millis,
            complete_history: state.complete_history,
            forward: state
                .forward
                .as_ref()
                .map(|snapshot| JobHealth::from_snapshot(snapshot, now, stall_factor)),
            backward: state
                .backward
                .as_ref()
                .map(|snapshot| JobHealth::from_snapshot(snapshot, now, stall_factor)),
        })
    }

    /// Recovers, then starts the fetch, completion, processor and compaction loops.
    pub async fn start(&self) -> Result<Vec<TaskHandle>, SyncError> {
        let completions = Arc::new(Mutex::new(self.inner.coordinator.subscribe().await));
        self.recover().await?;

        let account = self.inner.account.clone();
        let config = self.inner.config;

        let tracker = self.clone();
        let fetch = spawn_loop(
            format!("coverage fetch {account}"),
            None,
            config.error_delay,
            move || {
                let tracker = tracker.clone();
                async move {
                    tracker.fetch_tick().await?;
                    Ok(LoopSignal::Again(config.fetch_interval))
                }
            },
        );

        let tracker = self.clone();
        let listener = spawn_loop(
            format!("coverage completions {account}"),
            None,
            config.error_delay,
            move || {
                let tracker = tracker.clone();
                let completions = completions.clone();
                async move { tracker.listen_step(&completions).await }
            },
        );

        let tracker = self.clone();
        let processor = spawn_loop(
            format!("coverage processor {account}"),
            Some(self.inner.ready_wake.clone()),
            config.error_delay,
            move || {
                let tracker = tracker.clone();
                async move {
                    if tracker.process_ready().await? > 0 {
                        Ok(LoopSignal::Again(Duration::ZERO))
                    } else {
                        Ok(LoopSignal::Again(config.processor_idle))
                    }
                }
            },
        );

        let tracker = self.clone();
        let compaction = spawn_loop(
            format!("coverage compaction {account}"),
            None,
            config.error_delay,
            move || {
                let tracker = tracker.clone();
                async move {
                    tracker.compact().await?;
                    Ok(LoopSignal::Again(config.compaction_interval))
                }
            },
        );

        tracing::info!("started coverage tracking for {}", account);
        Ok(vec![fetch, listener, processor, compaction])
    }

    // bounded wait so that a stop request is observed
    async fn listen_step(
        &self,
        completions: &Mutex<mpsc::UnboundedReceiver<Nonce>>,
    ) -> Result<LoopSignal, SyncError> {
        let mut completions = completions.lock().await;
        match tokio::time::timeout(self.inner.config.processor_idle, completions.recv()).await {
            Ok(Some(nonce)) => {
                self.on_request_complete(nonce).await?;
                Ok(LoopSignal::Again(Duration::ZERO))
            }
            Ok(None) => Ok(LoopSignal::Stop),
            Err(_) => Ok(LoopSignal::Again(Duration::ZERO)),
        }
    }
}

/// Sets `drained` once the consumer has read `stream` to its end.
fn track_drain(stream: ResponseStream, drained: Arc<AtomicBool>) -> ResponseStream {
    let end = futures::stream::once(async move {
        drained.store(true, Ordering::SeqCst);
    })
    .filter_map(|()| futures::future::ready(None::<Result<LedgerItem, SyncError>>));
    stream.chain(end).boxed()
}
