//! Cursor jobs walking the history of tracked accounts.
//!
//! Each account has a forward job, catching up to the present, and a backward job,
//! backfilling history toward genesis. Both persist their [`FetchJobState`] after every run
//! so a restart resumes without re-scanning.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;

use ledger_status::{job_direction::JobDirection, rpc_tier::RpcTier};

use crate::{
    client::{fetch::fetch_history_page, LedgerClients, PageRequest},
    config::SchedulerConfig,
    error::SyncError,
    primitives::{FetchJobState, ItemRef, PaginationCursor},
    store::{KvStore, KvStoreExt, Table},
    task::{spawn_loop, LoopSignal, TaskHandle},
    utils,
};

pub mod adaptive;

/// Where cursor jobs deposit the items they observe.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Indexes `items` of `account`. Must be idempotent.
    async fn deposit(&self, account: &str, items: Vec<ItemRef>) -> Result<(), SyncError>;

    /// The oldest indexed item of `account`, the starting point of a fresh backward job.
    async fn oldest_known(&self, account: &str) -> Result<Option<PaginationCursor>, SyncError>;
}

/// Override-able cursor bookkeeping of a job run.
pub trait CursorPolicy: Send + Sync {
    /// Moves the cursor over the items of a successful run.
    ///
    /// Several items may share a position. Pages are newest first, so within a position the
    /// page order decides which item is newest.
    fn update_cursors(&self, state: &mut FetchJobState, fetched: &[ItemRef]) {
        let candidate = match state.direction {
            JobDirection::Forward => fetched.iter().rev().max_by_key(|item| item.position()),
            JobDirection::Backward => fetched.iter().rev().min_by_key(|item| item.position()),
        };
        let Some(candidate) = candidate.map(ItemRef::cursor) else {
            return;
        };
        let advance = match (&state.cursor, state.direction) {
            (None, _) => true,
            (Some(cursor), _) if cursor.id() == candidate.id() => false,
            (Some(cursor), JobDirection::Forward) => candidate.position() >= cursor.position(),
            (Some(cursor), JobDirection::Backward) => candidate.position() <= cursor.position(),
        };
        if !advance {
            return;
        }
        let position = candidate.position();
        if state
            .cursor
            .as_ref()
            .map_or(true, |cursor| cursor.position() != position)
        {
            state.cursor_siblings.clear();
        }
        state.cursor_siblings.extend(
            fetched
                .iter()
                .filter(|item| item.position() == position)
                .map(|item| item.id().clone()),
        );
        state.cursor = Some(candidate);
    }

    /// Whether the job's direction is exhausted after a run that fetched `fetched` items.
    ///
    /// A backward job is complete once a run on the final rpc tier yields no new items. An
    /// empty page is indistinguishable from true exhaustion, the heuristic is kept as is.
    fn check_complete(&self, state: &FetchJobState, fetched: usize, has_fallback: bool) -> bool {
        match state.direction {
            JobDirection::Forward => false,
            JobDirection::Backward => {
                fetched == 0 && (state.rpc_tier.is_fallback() || !has_fallback)
            }
        }
    }
}

/// The default cursor bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCursorPolicy;

impl CursorPolicy for DefaultCursorPolicy {}

/// Everything a job needs besides its own identity.
#[derive(Clone)]
pub struct JobContext {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) clients: LedgerClients,
    pub(crate) sink: Arc<dyn JobSink>,
    pub(crate) policy: Arc<dyn CursorPolicy>,
    pub(crate) config: SchedulerConfig,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn KvStore>,
        clients: LedgerClients,
        sink: Arc<dyn JobSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            clients,
            sink,
            policy: Arc::new(DefaultCursorPolicy),
            config,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CursorPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

fn job_state_key(account: &str, direction: JobDirection) -> Result<Vec<u8>, SyncError> {
    Ok(Table::JobState
        .key()
        .string(account)?
        .code(direction.key_code())
        .build())
}

/// Loads the persisted state of a job, `None` if it never ran.
pub(crate) async fn load_job_state(
    store: &dyn KvStore,
    account: &str,
    direction: JobDirection,
) -> Result<Option<FetchJobState>, SyncError> {
    Ok(store
        .get_json(&job_state_key(account, direction)?)
        .await?)
}

/// Outcome of a forward run. A failed run carries its error and leaves the cursor unchanged.
#[derive(Debug)]
pub struct JobRun {
    pub fetched: usize,
    /// delay until the next run
    pub next: Duration,
    pub error: Option<SyncError>,
}

/// One direction of one account's history walk.
pub struct FetchJob {
    account: String,
    direction: JobDirection,
    ctx: JobContext,
    /// forward: emits the first run. backward: waits for it, if a forward job exists.
    first_run_sender: Option<watch::Sender<bool>>,
    first_run_receiver: Option<watch::Receiver<bool>>,
}

impl FetchJob {
    /// A forward job and the receiver of its first-run signal.
    pub fn forward(account: &str, ctx: JobContext) -> (Self, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                account: account.to_string(),
                direction: JobDirection::Forward,
                ctx,
                first_run_sender: Some(sender),
                first_run_receiver: None,
            },
            receiver,
        )
    }

    /// A backward job. Without a first-run receiver it never defers.
    pub fn backward(
        account: &str,
        ctx: JobContext,
        first_run: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            account: account.to_string(),
            direction: JobDirection::Backward,
            ctx,
            first_run_sender: None,
            first_run_receiver: first_run,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn direction(&self) -> JobDirection {
        self.direction
    }

    fn initial_frequency(&self) -> u64 {
        match self.direction {
            JobDirection::Forward => utils::millis(
                self.ctx
                    .config
                    .forward_interval
                    .unwrap_or(crate::config::MIN_INTERVAL),
            ),
            JobDirection::Backward => utils::millis(self.ctx.config.backward_interval),
        }
    }

    pub async fn load_state(&self) -> Result<FetchJobState, SyncError> {
        Ok(
            load_job_state(self.ctx.store.as_ref(), &self.account, self.direction)
                .await?
                .unwrap_or_else(|| FetchJobState::new(self.direction, self.initial_frequency())),
        )
    }

    async fn save_state(&self, state: &FetchJobState) -> Result<(), SyncError> {
        self.ctx
            .store
            .put_json(job_state_key(&self.account, self.direction)?, state)
            .await?;
        Ok(())
    }

    fn page_request(
        &self,
        before: Option<PaginationCursor>,
        until: Option<PaginationCursor>,
    ) -> PageRequest {
        PageRequest {
            address: self.account.clone(),
            before,
            until,
            limit: self.ctx.config.page_limit.max(1),
        }
    }

    /// Runs the job once, returning when it wants to run again.
    pub async fn run_once(&self) -> Result<LoopSignal, SyncError> {
        match self.direction {
            JobDirection::Forward => {
                let run = self.run_forward().await?;
                if let Some(e) = &run.error {
                    tracing::warn!("forward job for {} failed. {}", self.account, e);
                }
                Ok(LoopSignal::Again(run.next))
            }
            JobDirection::Backward => self.run_backward().await,
        }
    }

    /// Walks from the newest item back to the cursor, depositing everything newer.
    pub async fn run_forward(&self) -> Result<JobRun, SyncError> {
        let mut state = self.load_state().await?;

        let outcome = async {
            let items = self.walk_forward(state.cursor.clone()).await?;
            if !items.is_empty() {
                self.ctx.sink.deposit(&self.account, items.clone()).await?;
            }
            Ok::<_, SyncError>(items)
        }
        .await;

        state.last_run_at = Some(utils::now_millis());
        state.run_count += 1;
        let (fetched, error) = match outcome {
            Ok(items) => {
                self.ctx.policy.update_cursors(&mut state, &items);
                (items.len(), None)
            }
            Err(e) => (0, Some(e)),
        };
        state.frequency_millis = match self.ctx.config.forward_interval {
            Some(interval) => utils::millis(interval),
            None => utils::millis(adaptive::next_interval(
                Duration::from_millis(state.frequency_millis),
                fetched as u64,
                &self.ctx.config.adaptive,
            )),
        };
        self.save_state(&state).await?;

        if error.is_none() {
            if let Some(sender) = &self.first_run_sender {
                if !*sender.borrow() {
                    tracing::debug!("forward job for {} completed its first run", self.account);
                    sender.send_replace(true);
                }
            }
        }

        Ok(JobRun {
            fetched,
            next: Duration::from_millis(state.frequency_millis),
            error,
        })
    }

    // without a cursor only the newest page is taken, older history is the backward job's
    async fn walk_forward(
        &self,
        until: Option<PaginationCursor>,
    ) -> Result<Vec<ItemRef>, SyncError> {
        let ledger = self.ctx.clients.primary();
        let policy = &self.ctx.config.page_retry;

        let Some(until) = until else {
            let page =
                fetch_history_page(ledger.as_ref(), &self.page_request(None, None), policy).await?;
            return Ok(page.items);
        };

        let mut collected = Vec::new();
        let mut before: Option<PaginationCursor> = None;
        loop {
            let request = self.page_request(before.clone(), Some(until.clone()));
            let page = fetch_history_page(ledger.as_ref(), &request, policy).await?;
            let page_len = page.items.len();

            let mut reached_until = false;
            for item in page.items {
                // servers are unreliable at the until edge
                if item.id() == until.id() || item.position() < until.position() {
                    reached_until = true;
                    break;
                }
                collected.push(item);
            }
            if reached_until || page_len < request.limit {
                break;
            }
            let Some(last) = page.last_key else {
                break;
            };
            // a page not reaching past the previous one means `before` was ignored
            if before.as_ref().is_some_and(|previous| {
                last.id() == previous.id() || last.position() > previous.position()
            }) {
                break;
            }
            before = Some(last);
        }
        Ok(collected)
    }

    /// Fetches one page older than the cursor, swapping to the fallback rpc once the
    /// primary runs dry.
    pub async fn run_backward(&self) -> Result<LoopSignal, SyncError> {
        let mut state = self.load_state().await?;
        if state.complete {
            return Ok(LoopSignal::Stop);
        }
        if let Some(first_run) = &self.first_run_receiver {
            if !*first_run.borrow() {
                tracing::debug!(
                    "backward job for {} waits for the forward job's first run",
                    self.account
                );
                return Ok(LoopSignal::Again(self.ctx.config.defer_delay));
            }
        }

        let has_fallback = self.ctx.clients.has_fallback();
        if state.cursor.is_none() {
            state.cursor = self.ctx.sink.oldest_known(&self.account).await?;
        }

        loop {
            state.last_run_at = Some(utils::now_millis());
            state.run_count += 1;

            let items = match self.fetch_older(&state).await {
                Ok(items) => items,
                Err(e) => {
                    self.save_state(&state).await?;
                    return Err(e);
                }
            };
            self.ctx.policy.update_cursors(&mut state, &items);

            if items.is_empty() && state.rpc_tier == RpcTier::Primary && has_fallback {
                tracing::info!(
                    "backward job for {} found no older items on the {}, swapping to the {}",
                    self.account,
                    RpcTier::Primary,
                    RpcTier::Fallback
                );
                state.rpc_tier = RpcTier::Fallback;
                self.save_state(&state).await?;
                continue;
            }

            state.complete = self
                .ctx
                .policy
                .check_complete(&state, items.len(), has_fallback);
            state.frequency_millis = utils::millis(self.ctx.config.backward_interval);
            self.save_state(&state).await?;

            if state.complete {
                tracing::info!("backward job for {} reached genesis", self.account);
                return Ok(LoopSignal::Stop);
            }
            return Ok(LoopSignal::Again(self.ctx.config.backward_interval));
        }
    }

    async fn fetch_older(&self, state: &FetchJobState) -> Result<Vec<ItemRef>, SyncError> {
        let ledger = self.ctx.clients.for_tier(state.rpc_tier)?;
        let request = self.page_request(state.cursor.clone(), None);
        let page =
            fetch_history_page(ledger.as_ref(), &request, &self.ctx.config.page_retry).await?;

        let items: Vec<ItemRef> = page
            .items
            .into_iter()
            .filter(|item| match &state.cursor {
                None => true,
                Some(cursor) if item.position() == cursor.position() => {
                    item.id() != cursor.id() && !state.cursor_siblings.contains(item.id())
                }
                Some(cursor) => item.position() < cursor.position(),
            })
            .collect();
        if !items.is_empty() {
            self.ctx.sink.deposit(&self.account, items.clone()).await?;
        }
        Ok(items)
    }
}

/// Runs the forward and backward job of one account.
pub struct CursorJobScheduler {
    account: String,
    forward: TaskHandle,
    backward: TaskHandle,
}

impl CursorJobScheduler {
    pub fn start(account: &str, ctx: JobContext) -> Self {
        let error_delay = ctx.config.error_delay;
        let (forward_job, first_run) = FetchJob::forward(account, ctx.clone());
        let backward_job = FetchJob::backward(account, ctx, Some(first_run));

        let forward_job = Arc::new(forward_job);
        let forward = spawn_loop(
            format!("forward job {account}"),
            None,
            error_delay,
            move || {
                let job = forward_job.clone();
                async move { job.run_once().await }
            },
        );
        let backward_job = Arc::new(backward_job);
        let backward = spawn_loop(
            format!("backward job {account}"),
            None,
            error_delay,
            move || {
                let job = backward_job.clone();
                async move { job.run_once().await }
            },
        );

        tracing::info!("started cursor jobs for {}", account);
        Self {
            account: account.to_string(),
            forward,
            backward,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// `true` once the backward job stopped, normally because it reached genesis.
    pub fn is_backward_finished(&self) -> bool {
        self.backward.is_finished()
    }

    /// Cancels future runs. In-flight runs finish and persist.
    pub fn stop(&self) {
        self.forward.stop();
        self.backward.stop();
    }

    pub async fn stop_and_join(self) {
        self.forward.stop_and_join().await;
        self.backward.stop_and_join().await;
    }
}
