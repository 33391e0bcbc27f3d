//! Storage contract of the sync engine.
//!
//! Every record is persisted as a JSON value under a composite key built with [`KeyBuilder`].
//! Keys sort lexicographically, so a range scan over a key prefix yields rows ordered by the
//! remaining components.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

pub mod memory;

/// Fixed width of string key components. Shorter strings are zero padded.
pub const STRING_COMPONENT_WIDTH: usize = 128;

/// A raw key value pair returned by range scans.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// One write of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a value
    Put {
        /// Composite key
        key: Vec<u8>,
        /// Encoded value
        value: Vec<u8>,
    },
    /// Remove a key if present
    Delete {
        /// Composite key
        key: Vec<u8>,
    },
}

/// Options of a range scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Yield keys in descending order
    pub reverse: bool,
    /// Maximum number of rows returned
    pub limit: Option<usize>,
}

impl ScanOptions {
    /// Ascending scan returning at most `limit` rows.
    pub fn limit(limit: usize) -> Self {
        Self {
            reverse: false,
            limit: Some(limit),
        }
    }

    /// Descending scan returning at most `limit` rows.
    pub fn reverse_limit(limit: usize) -> Self {
        Self {
            reverse: true,
            limit: Some(limit),
        }
    }
}

/// Ordered key value storage engine.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns the values of `keys`, in the same order.
    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Applies all writes of the batch atomically.
    async fn apply(&self, batch: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Returns the rows with `start <= key < end`.
    async fn get_all_from_to(
        &self,
        start: &[u8],
        end: &[u8],
        options: ScanOptions,
    ) -> Result<Vec<KeyValue>, StoreError>;

    /// Counts the rows with `start <= key < end`.
    async fn count_from_to(&self, start: &[u8], end: &[u8]) -> Result<usize, StoreError> {
        Ok(self
            .get_all_from_to(start, end, ScanOptions::default())
            .await?
            .len())
    }
}

/// Table tags. The first byte of every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Table {
    QueueOrder = 1,
    QueueIndex = 2,
    JobState = 3,
    TrackedAccount = 4,
    ItemRef = 5,
    ItemRefById = 6,
    Payload = 7,
    Request = 8,
    PendingItem = 9,
    PendingByNonce = 10,
    ResponseSlot = 11,
    ResponseIndex = 12,
    Coverage = 13,
}

impl Table {
    pub(crate) fn key(self) -> KeyBuilder {
        KeyBuilder::new(self as u8)
    }
}

/// Builds fixed-width, lexicographically sortable composite keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    bytes: Vec<u8>,
}

impl KeyBuilder {
    /// Starts a key with a one byte table tag.
    pub fn new(tag: u8) -> Self {
        Self { bytes: vec![tag] }
    }

    /// Appends a zero padded string component.
    pub fn string(mut self, value: &str) -> Result<Self, StoreError> {
        let bytes = value.as_bytes();
        if bytes.len() > STRING_COMPONENT_WIDTH {
            return Err(StoreError::KeyComponentTooLong {
                len: bytes.len(),
                max: STRING_COMPONENT_WIDTH,
            });
        }
        if bytes.contains(&0) {
            return Err(StoreError::KeyComponentContainsNul);
        }
        self.bytes.extend_from_slice(bytes);
        self.bytes
            .resize(self.bytes.len() + STRING_COMPONENT_WIDTH - bytes.len(), 0);
        Ok(self)
    }

    /// Appends a big endian integer component.
    pub fn u64(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a one byte enum code.
    pub fn code(mut self, code: u8) -> Self {
        self.bytes.push(code);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    /// The `[start, end)` key range of every key starting with this prefix.
    pub fn prefix_range(self) -> (Vec<u8>, Vec<u8>) {
        let end = prefix_end(&self.bytes);
        (self.bytes, end)
    }
}

/// The smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // all bytes were 0xff, no upper bound below the end of the keyspace
    vec![u8::MAX; prefix.len() + 1]
}

/// Collects writes into one atomic batch.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<V: Serialize>(&mut self, key: Vec<u8>, value: &V) -> Result<(), StoreError> {
        self.ops.push(BatchOp::Put {
            key,
            value: serde_json::to_vec(value)?,
        });
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Typed JSON access on top of any [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<V>(&self, key: &[u8]) -> Result<Option<V>, StoreError>
    where
        V: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<V>(&self, key: Vec<u8>, value: &V) -> Result<(), StoreError>
    where
        V: Serialize + Sync,
    {
        let mut batch = WriteBatch::new();
        batch.put(key, value)?;
        self.write(batch).await
    }

    /// Decodes every value of a range scan.
    async fn scan_json<V>(
        &self,
        start: &[u8],
        end: &[u8],
        options: ScanOptions,
    ) -> Result<Vec<(Vec<u8>, V)>, StoreError>
    where
        V: DeserializeOwned + Send,
    {
        self.get_all_from_to(start, end, options)
            .await?
            .into_iter()
            .map(|(key, value)| -> Result<(Vec<u8>, V), StoreError> {
                Ok((key, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    async fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.apply(batch.into_ops()).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_components_sort_like_strings() {
        let short = KeyBuilder::new(1).string("ab").unwrap().u64(9).build();
        let long = KeyBuilder::new(1).string("abc").unwrap().u64(0).build();
        assert!(short < long);
        assert_eq!(short.len(), 1 + STRING_COMPONENT_WIDTH + 8);
    }

    #[test]
    fn integers_sort_numerically() {
        let small = KeyBuilder::new(1).u64(255).build();
        let large = KeyBuilder::new(1).u64(256).build();
        assert!(small < large);
    }

    #[test]
    fn oversized_and_nul_components_are_rejected() {
        let oversized = "x".repeat(STRING_COMPONENT_WIDTH + 1);
        assert!(matches!(
            KeyBuilder::new(1).string(&oversized),
            Err(StoreError::KeyComponentTooLong { .. })
        ));
        assert!(matches!(
            KeyBuilder::new(1).string("a\0b"),
            Err(StoreError::KeyComponentContainsNul)
        ));
    }

    #[test]
    fn prefix_range_bounds_every_extension() {
        let (start, end) = KeyBuilder::new(3).string("acc").unwrap().prefix_range();
        let inside = KeyBuilder::new(3)
            .string("acc")
            .unwrap()
            .u64(u64::MAX)
            .build();
        let outside = KeyBuilder::new(3).string("acd").unwrap().build();
        assert!(start <= inside && inside < end);
        assert!(outside >= end);
        assert_eq!(prefix_end(&[1, 0xff, 0xff]), vec![2]);
    }
}
