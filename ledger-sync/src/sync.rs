//! Entrypoint for the sync engine

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    client::{LedgerClients, RemoteLedger},
    config::SyncConfig,
    coordinator::RangeRequestCoordinator,
    coverage::{CoverageProgress, CoverageTracker},
    error::SyncError,
    fetcher::LedgerFetcher,
    interface::{FetchControl, RangeConsumer},
    store::KvStore,
    task::TaskHandle,
};

struct TrackedAccount {
    tracker: CoverageTracker,
    tasks: Vec<TaskHandle>,
}

/// A running sync engine: the fetch subsystem, the range request coordinator and one
/// coverage tracker per tracked account.
///
/// Tracked accounts survive a restart and their cursor jobs resume on launch. Coverage is
/// only driven for accounts given a consumer with [`SyncEngine::track_account`].
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn KvStore>,
    fetcher: LedgerFetcher,
    coordinator: RangeRequestCoordinator,
    background: Vec<TaskHandle>,
    accounts: Mutex<HashMap<String, TrackedAccount>>,
}

impl SyncEngine {
    /// Loads persisted state from `store` and starts the background loops.
    pub async fn launch(
        config: SyncConfig,
        store: Arc<dyn KvStore>,
        primary: Arc<dyn RemoteLedger>,
        fallback: Option<Arc<dyn RemoteLedger>>,
    ) -> Result<Self, SyncError> {
        tracing::info!("Launching sync engine...");

        let fetcher = LedgerFetcher::new(
            store.clone(),
            LedgerClients::new(primary, fallback),
            config.scheduler.clone(),
            config.queue,
        );
        let coordinator =
            RangeRequestCoordinator::load(store.clone(), Arc::new(fetcher.clone()), config.coordinator)
                .await?;

        let mut background = coordinator.start();
        background.push(fetcher.start(Arc::new(coordinator.clone())).await?);

        Ok(Self {
            config,
            store,
            fetcher,
            coordinator,
            background,
            accounts: Mutex::new(HashMap::new()),
        })
    }

    pub fn coordinator(&self) -> &RangeRequestCoordinator {
        &self.coordinator
    }

    pub fn fetcher(&self) -> &LedgerFetcher {
        &self.fetcher
    }

    /// Tracks `account` and hands its covered date ranges to `consumer`. Tracking an
    /// account again replaces its consumer.
    pub async fn track_account(
        &self,
        account: &str,
        consumer: Arc<dyn RangeConsumer>,
    ) -> Result<(), SyncError> {
        let mut accounts = self.accounts.lock().await;
        if let Some(previous) = accounts.remove(account) {
            for task in previous.tasks {
                task.stop_and_join().await;
            }
        }

        self.fetcher.add_tracked_account(account).await?;
        let tracker = CoverageTracker::new(
            account,
            self.store.clone(),
            self.coordinator.clone(),
            Arc::new(self.fetcher.clone()),
            consumer,
            self.config.coverage,
        );
        let tasks = tracker.start().await?;
        accounts.insert(account.to_string(), TrackedAccount { tracker, tasks });
        Ok(())
    }

    /// Stops syncing `account`. Its index and coverage records are kept.
    pub async fn untrack_account(&self, account: &str) -> Result<(), SyncError> {
        let removed = self.accounts.lock().await.remove(account);
        if let Some(removed) = removed {
            for task in removed.tasks {
                task.stop_and_join().await;
            }
        }
        self.fetcher.remove_tracked_account(account).await
    }

    /// Coverage progress of a tracked account.
    pub async fn progress(&self, account: &str) -> Result<CoverageProgress, SyncError> {
        let tracker = self
            .accounts
            .lock()
            .await
            .get(account)
            .map(|tracked| tracked.tracker.clone())
            .ok_or_else(|| SyncError::AccountNotTracked(account.to_string()))?;
        tracker.progress(self.config.scheduler.stall_factor).await
    }

    /// Stops every loop, letting in-flight runs finish and persist.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down sync engine...");
        let accounts: Vec<TrackedAccount> = self
            .accounts
            .into_inner()
            .into_values()
            .collect();
        for account in accounts {
            for task in account.tasks {
                task.stop_and_join().await;
            }
        }
        self.fetcher.stop().await;
        for task in self.background {
            task.stop_and_join().await;
        }
    }
}
