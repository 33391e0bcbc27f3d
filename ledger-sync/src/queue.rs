//! Durable, checkpointed work queue driving batch processing with bounded concurrency.
//!
//! Items are only removed from storage once handled successfully, or once the handler's
//! completion predicate holds, so a crash mid-processing re-delivers them.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use getset::{CopyGetters, Getters};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::{
    config::QueueConfig,
    error::SyncError,
    primitives::ItemId,
    store::{KvStore, KvStoreExt, ScanOptions, Table, WriteBatch},
    task::{spawn_loop, LoopSignal, TaskHandle},
    utils,
};

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct WorkItem<T> {
    #[getset(get = "pub")]
    id: ItemId,
    #[getset(get_copy = "pub")]
    enqueued_at: u64,
    /// bumped whenever the id is added again while still queued
    #[getset(get_copy = "pub")]
    generation: u64,
    #[getset(get = "pub")]
    payload: T,
}

impl<T> WorkItem<T> {
    pub fn into_payload(self) -> T {
        self.payload
    }

    fn claim(&self) -> Claim {
        Claim {
            id: self.id.clone(),
            enqueued_at: self.enqueued_at,
            generation: self.generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    enqueued_at: u64,
    generation: u64,
}

/// Identifies the exact version of an item that was handed out.
#[derive(Debug, Clone)]
struct Claim {
    id: ItemId,
    enqueued_at: u64,
    generation: u64,
}

/// Owner supplied processing of queued items.
#[async_trait]
pub trait WorkHandler<T>: Send + Sync {
    /// Handles one chunk. A returned delay postpones the queue's next iteration.
    async fn handle(&self, chunk: Vec<WorkItem<T>>) -> Result<Option<Duration>, SyncError>;

    /// `true` if the item needs no handling, it is then removed directly.
    async fn check_complete(&self, item: &WorkItem<T>) -> Result<bool, SyncError>;
}

type IdExtractor<T> = Box<dyn Fn(&T) -> ItemId + Send + Sync>;

struct QueueInner<T> {
    name: String,
    store: Arc<dyn KvStore>,
    config: QueueConfig,
    id_of: IdExtractor<T>,
    write_lock: Mutex<()>,
    wake: Arc<Notify>,
}

/// A named queue of work items persisted in a [`KvStore`].
pub struct DurableWorkQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for DurableWorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> DurableWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn KvStore>,
        config: QueueConfig,
        id_of: impl Fn(&T) -> ItemId + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                store,
                config,
                id_of: Box::new(id_of),
                write_lock: Mutex::new(()),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn order_key(&self, enqueued_at: u64, id: &str) -> Result<Vec<u8>, SyncError> {
        Ok(Table::QueueOrder
            .key()
            .string(&self.inner.name)?
            .u64(enqueued_at)
            .string(id)?
            .build())
    }

    fn index_key(&self, id: &str) -> Result<Vec<u8>, SyncError> {
        Ok(Table::QueueIndex
            .key()
            .string(&self.inner.name)?
            .string(id)?
            .build())
    }

    fn order_range(&self) -> Result<(Vec<u8>, Vec<u8>), SyncError> {
        Ok(Table::QueueOrder
            .key()
            .string(&self.inner.name)?
            .prefix_range())
    }

    /// Durably queues `items`, returning how many ids were not queued before.
    ///
    /// Adding an id that is still queued keeps its position but bumps its generation, so a
    /// delivery already in flight does not remove it.
    pub async fn add_work(&self, items: Vec<T>) -> Result<usize, SyncError> {
        if items.is_empty() {
            return Ok(0);
        }

        let _guard = self.inner.write_lock.lock().await;
        let now = utils::now_millis();
        let mut batch = WriteBatch::new();
        let mut entries: std::collections::HashMap<ItemId, IndexEntry> =
            std::collections::HashMap::new();
        let mut added = 0;

        for payload in items {
            let id = (self.inner.id_of)(&payload);
            let index_key = self.index_key(&id)?;
            let existing = match entries.get(&id) {
                Some(entry) => Some(*entry),
                None => self.inner.store.get_json::<IndexEntry>(&index_key).await?,
            };
            let entry = match existing {
                Some(entry) => IndexEntry {
                    enqueued_at: entry.enqueued_at,
                    generation: entry.generation + 1,
                },
                None => {
                    added += 1;
                    IndexEntry {
                        enqueued_at: now,
                        generation: 0,
                    }
                }
            };

            let item = WorkItem {
                id: id.clone(),
                enqueued_at: entry.enqueued_at,
                generation: entry.generation,
                payload,
            };
            batch.put(self.order_key(entry.enqueued_at, &id)?, &item)?;
            batch.put(index_key, &entry)?;
            entries.insert(id, entry);
        }
        self.inner.store.write(batch).await?;
        drop(_guard);

        self.inner.wake.notify_one();
        Ok(added)
    }

    /// Removes handed out items unless they were re-added since.
    async fn remove(&self, claims: &[Claim]) -> Result<(), SyncError> {
        if claims.is_empty() {
            return Ok(());
        }

        let _guard = self.inner.write_lock.lock().await;
        let mut batch = WriteBatch::new();
        for claim in claims {
            let index_key = self.index_key(&claim.id)?;
            match self.inner.store.get_json::<IndexEntry>(&index_key).await? {
                Some(entry) if entry.generation == claim.generation => {
                    batch.delete(index_key);
                    batch.delete(self.order_key(claim.enqueued_at, &claim.id)?);
                }
                Some(_) => {
                    tracing::debug!(
                        "{} queue: {} was re-added while in flight, keeping it",
                        self.inner.name,
                        claim.id
                    );
                }
                None => (),
            }
        }
        self.inner.store.write(batch).await?;
        Ok(())
    }

    pub async fn get_count(&self) -> Result<usize, SyncError> {
        let (start, end) = self.order_range()?;
        Ok(self.inner.store.count_from_to(&start, &end).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkItem<T>>, SyncError> {
        let Some(entry) = self
            .inner
            .store
            .get_json::<IndexEntry>(&self.index_key(id)?)
            .await?
        else {
            return Ok(None);
        };
        Ok(self
            .inner
            .store
            .get_json(&self.order_key(entry.enqueued_at, id)?)
            .await?)
    }

    /// The oldest queued item.
    pub async fn get_first_value(&self) -> Result<Option<WorkItem<T>>, SyncError> {
        Ok(self.oldest(1).await?.into_iter().next())
    }

    /// Age of the oldest queued item.
    pub async fn latency(&self) -> Result<Option<Duration>, SyncError> {
        Ok(self.get_first_value().await?.map(|item| {
            Duration::from_millis(utils::now_millis().saturating_sub(item.enqueued_at))
        }))
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<WorkItem<T>>, SyncError> {
        let (start, end) = self.order_range()?;
        Ok(self
            .inner
            .store
            .scan_json::<WorkItem<T>>(&start, &end, ScanOptions::limit(limit))
            .await?
            .into_iter()
            .map(|(_, item)| item)
            .collect())
    }

    /// Runs one iteration of the queue loop.
    pub async fn process_next(
        &self,
        handler: &dyn WorkHandler<T>,
    ) -> Result<LoopSignal, SyncError> {
        let chunk_size = self.inner.config.chunk_size.max(1);
        let concurrency = self.inner.config.concurrency.max(1);

        let items = self.oldest(chunk_size * concurrency).await?;
        if items.is_empty() {
            return Ok(LoopSignal::Again(self.inner.config.idle_delay));
        }

        let mut completed = Vec::new();
        let mut remaining = Vec::new();
        for item in items {
            if handler.check_complete(&item).await? {
                completed.push(item.claim());
            } else {
                remaining.push(item);
            }
        }
        if !completed.is_empty() {
            tracing::debug!(
                "{} queue: {} items already complete",
                self.inner.name,
                completed.len()
            );
            self.remove(&completed).await?;
        }

        let mut chunks: Vec<Vec<WorkItem<T>>> = Vec::new();
        for item in remaining {
            match chunks.last_mut() {
                Some(chunk) if chunk.len() < chunk_size => chunk.push(item),
                _ => chunks.push(vec![item]),
            }
        }

        let tasks = chunks
            .into_iter()
            .map(|chunk| {
                let claims = chunk.iter().map(WorkItem::claim).collect::<Vec<_>>();
                async move { (claims, handler.handle(chunk).await) }
            })
            .collect::<Vec<_>>();
        let results: Vec<(Vec<Claim>, Result<Option<Duration>, SyncError>)> =
            futures::stream::iter(tasks)
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut handled = Vec::new();
        let mut delay = Duration::ZERO;
        let mut first_error = None;
        for (claims, result) in results {
            match result {
                Ok(requested_delay) => {
                    handled.extend(claims);
                    delay = delay.max(requested_delay.unwrap_or_default());
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.remove(&handled).await?;

        match first_error {
            Some(e) => Err(e),
            None if delay.is_zero() => Ok(LoopSignal::Again(Duration::ZERO)),
            // new work must not cut a requested delay short
            None => Ok(LoopSignal::Backoff(delay)),
        }
    }

    /// Starts the queue loop. Adding work wakes an idle loop, but not one backing off on a
    /// handler's request.
    pub fn start(&self, handler: Arc<dyn WorkHandler<T>>) -> TaskHandle {
        let queue = self.clone();
        spawn_loop(
            format!("{} queue", self.inner.name),
            Some(self.inner.wake.clone()),
            self.inner.config.error_delay,
            move || {
                let queue = queue.clone();
                let handler = handler.clone();
                async move { queue.process_next(handler.as_ref()).await }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use super::*;
    use crate::store::memory::MemoryStore;

    fn queue(chunk_size: usize, concurrency: usize) -> DurableWorkQueue<String> {
        DurableWorkQueue::new(
            "test",
            Arc::new(MemoryStore::new()),
            QueueConfig {
                chunk_size,
                concurrency,
                idle_delay: Duration::from_millis(5),
                error_delay: Duration::from_millis(5),
            },
            |payload: &String| payload.clone(),
        )
    }

    fn work(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[derive(Default)]
    struct RecordingHandler {
        handled: StdMutex<Vec<Vec<ItemId>>>,
        complete: StdMutex<Vec<ItemId>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Option<ItemId>,
        delay: Option<Duration>,
        requeue: StdMutex<Option<DurableWorkQueue<String>>>,
    }

    #[async_trait]
    impl WorkHandler<String> for RecordingHandler {
        async fn handle(
            &self,
            chunk: Vec<WorkItem<String>>,
        ) -> Result<Option<Duration>, SyncError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let ids: Vec<ItemId> = chunk.iter().map(|item| item.id().clone()).collect();
            self.handled.lock().unwrap().push(ids.clone());

            let requeue = self.requeue.lock().unwrap().take();
            if let Some(queue) = requeue {
                queue.add_work(ids.clone()).await?;
            }
            if self.fail_on.as_ref().is_some_and(|id| ids.contains(id)) {
                return Err(SyncError::ConsumerError("boom".to_string()));
            }
            Ok(self.delay)
        }

        async fn check_complete(&self, item: &WorkItem<String>) -> Result<bool, SyncError> {
            Ok(self.complete.lock().unwrap().contains(item.id()))
        }
    }

    #[tokio::test]
    async fn add_work_is_idempotent_on_id() {
        let queue = queue(2, 2);
        assert_eq!(queue.add_work(work(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(queue.add_work(work(&["b", "c", "c"])).await.unwrap(), 1);

        assert_eq!(queue.get_count().await.unwrap(), 3);
        assert_eq!(queue.get("b").await.unwrap().unwrap().generation(), 1);
        assert_eq!(queue.get("c").await.unwrap().unwrap().generation(), 1);
        assert!(queue.get("d").await.unwrap().is_none());
        assert!(queue.get_first_value().await.unwrap().is_some());
        assert!(queue.latency().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn handled_items_are_removed_in_chunks_with_bounded_concurrency() {
        let queue = queue(2, 2);
        queue
            .add_work(work(&["a", "b", "c", "d", "e", "f", "g"]))
            .await
            .unwrap();
        let handler = RecordingHandler::default();

        queue.process_next(&handler).await.unwrap();

        let handled = handler.handled.lock().unwrap().clone();
        assert_eq!(handled.iter().map(Vec::len).sum::<usize>(), 4);
        assert!(handled.iter().all(|chunk| chunk.len() <= 2));
        assert!(handler.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.get_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn complete_items_skip_the_handler() {
        let queue = queue(10, 1);
        queue.add_work(work(&["a", "b"])).await.unwrap();
        let handler = RecordingHandler::default();
        handler.complete.lock().unwrap().push("a".to_string());

        queue.process_next(&handler).await.unwrap();

        assert_eq!(
            handler.handled.lock().unwrap().clone(),
            vec![vec!["b".to_string()]]
        );
        assert_eq!(queue.get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_chunks_stay_queued() {
        let queue = queue(1, 2);
        queue.add_work(work(&["a", "b"])).await.unwrap();
        let handler = RecordingHandler {
            fail_on: Some("b".to_string()),
            ..Default::default()
        };

        assert!(queue.process_next(&handler).await.is_err());
        assert!(queue.get("a").await.unwrap().is_none());
        assert!(queue.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn handler_delay_postpones_the_next_iteration() {
        let queue = queue(1, 1);
        queue.add_work(work(&["a"])).await.unwrap();
        let handler = RecordingHandler {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        assert_eq!(
            queue.process_next(&handler).await.unwrap(),
            LoopSignal::Backoff(Duration::from_secs(5))
        );
        assert_eq!(
            queue.process_next(&handler).await.unwrap(),
            LoopSignal::Again(Duration::from_millis(5))
        );
    }

    #[tokio::test]
    async fn items_re_added_in_flight_are_delivered_again() {
        let queue = queue(1, 1);
        queue.add_work(work(&["a"])).await.unwrap();
        let handler = RecordingHandler::default();
        *handler.requeue.lock().unwrap() = Some(queue.clone());

        queue.process_next(&handler).await.unwrap();
        assert_eq!(queue.get_count().await.unwrap(), 1);

        queue.process_next(&handler).await.unwrap();
        assert_eq!(queue.get_count().await.unwrap(), 0);
        assert_eq!(handler.handled.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn started_queue_drains_new_work() {
        let queue = queue(5, 2);
        let handler = Arc::new(RecordingHandler::default());
        let task = queue.start(handler.clone());

        queue.add_work(work(&["a", "b", "c"])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.get_count().await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        task.stop_and_join().await;
    }

    #[tokio::test]
    async fn new_work_does_not_end_a_requested_backoff() {
        let queue = queue(1, 1);
        let handler = Arc::new(RecordingHandler {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let task = queue.start(handler.clone());

        queue.add_work(work(&["a"])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        queue.add_work(work(&["b"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            handler.handled.lock().unwrap().clone(),
            vec![vec!["a".to_string()]]
        );
        assert_eq!(queue.get_count().await.unwrap(), 1);

        task.stop_and_join().await;
    }
}
