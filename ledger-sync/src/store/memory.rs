//! In-memory storage engine, used for tests and embedded deployments.

use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;

use crate::error::StoreError;

use super::{BatchOp, KeyValue, KvStore, ScanOptions};

/// A [`KvStore`] backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows across every table.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(key).cloned())
    }

    async fn apply(&self, batch: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    rows.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn get_all_from_to(
        &self,
        start: &[u8],
        end: &[u8],
        options: ScanOptions,
    ) -> Result<Vec<KeyValue>, StoreError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().map_err(poisoned)?;
        let range = rows.range::<[u8], _>((
            std::ops::Bound::Included(start),
            std::ops::Bound::Excluded(end),
        ));
        let limit = options.limit.unwrap_or(usize::MAX);
        let collected = if options.reverse {
            range
                .rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            range
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(collected)
    }

    async fn count_from_to(&self, start: &[u8], end: &[u8]) -> Result<usize, StoreError> {
        if start >= end {
            return Ok(0);
        }
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .range::<[u8], _>((
                std::ops::Bound::Included(start),
                std::ops::Bound::Excluded(end),
            ))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyBuilder, KvStoreExt, WriteBatch};

    fn key(n: u64) -> Vec<u8> {
        KeyBuilder::new(1).u64(n).build()
    }

    #[tokio::test]
    async fn scans_respect_bounds_direction_and_limit() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for n in 0..10u64 {
            batch.put(key(n), &n).unwrap();
        }
        store.write(batch).await.unwrap();

        let forward: Vec<(Vec<u8>, u64)> = store
            .scan_json(&key(2), &key(6), ScanOptions::default())
            .await
            .unwrap();
        assert_eq!(
            forward.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );

        let reverse: Vec<(Vec<u8>, u64)> = store
            .scan_json(&key(0), &key(10), ScanOptions::reverse_limit(2))
            .await
            .unwrap();
        assert_eq!(
            reverse.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            vec![9, 8]
        );
        assert_eq!(store.count_from_to(&key(0), &key(10)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn batches_apply_puts_and_deletes() {
        let store = MemoryStore::new();
        store.put_json(key(1), &"one").await.unwrap();
        store
            .apply(vec![
                BatchOp::Delete { key: key(1) },
                BatchOp::Put {
                    key: key(2),
                    value: b"\"two\"".to_vec(),
                },
            ])
            .await
            .unwrap();

        assert!(!store.exists(&key(1)).await.unwrap());
        assert_eq!(
            store.get_json::<String>(&key(2)).await.unwrap(),
            Some("two".to_string())
        );
        assert_eq!(
            store.get_many(&[key(1), key(2)]).await.unwrap(),
            vec![None, Some(b"\"two\"".to_vec())]
        );
    }
}
