//! The response of a completed range request.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};

use crate::{
    error::{StoreError, SyncError},
    interface::ResponseStream,
    primitives::{ItemId, LedgerItem, Nonce},
    store::{KvStore, ScanOptions, WriteBatch},
};

use super::{
    request::{RangeRequest, ResponseSlot},
    response_index_range, slot_key, RangeRequestCoordinator,
};

/// Matched payloads of a completed request, and the handle deleting them.
pub struct RangeResponse {
    coordinator: RangeRequestCoordinator,
    request: RangeRequest,
}

impl RangeResponse {
    pub(crate) fn new(coordinator: RangeRequestCoordinator, request: RangeRequest) -> Self {
        Self {
            coordinator,
            request,
        }
    }

    pub fn request(&self) -> &RangeRequest {
        &self.request
    }

    pub fn nonce(&self) -> Nonce {
        self.request.nonce()
    }

    /// Opens a lazy stream over the matched payloads, in the order the items had within the
    /// request. Every call starts from the beginning.
    pub fn stream(&self) -> ResponseStream {
        let store = self.coordinator.store();
        let page_size = self.coordinator.config().response_page_size.max(1);
        let nonce = self.nonce();
        let (start, end) = response_index_range(nonce);

        futures::stream::try_unfold(Some(start), move |cursor| {
            let store = store.clone();
            let end = end.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, SyncError>(None);
                };
                let (items, next) = read_page(store, nonce, cursor, &end, page_size).await?;
                Ok(Some((items, next)))
            }
        })
        .map_ok(|items| futures::stream::iter(items.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    /// Deletes the request and releases its response slots.
    pub async fn remove(self) -> Result<(), SyncError> {
        self.remove_with(WriteBatch::new()).await
    }

    /// Like [`RangeResponse::remove`], committing `batch` in the same atomic write.
    pub async fn remove_with(self, batch: WriteBatch) -> Result<(), SyncError> {
        self.coordinator
            .remove_request(self.request.nonce(), batch)
            .await
    }
}

async fn read_page(
    store: Arc<dyn KvStore>,
    nonce: Nonce,
    cursor: Vec<u8>,
    end: &[u8],
    page_size: usize,
) -> Result<(Vec<LedgerItem>, Option<Vec<u8>>), SyncError> {
    let rows = store
        .get_all_from_to(&cursor, end, ScanOptions::limit(page_size))
        .await?;
    let next = if rows.len() < page_size {
        None
    } else {
        rows.last().map(|(key, _)| {
            let mut successor = key.clone();
            successor.push(0);
            successor
        })
    };

    let ids = rows
        .iter()
        .map(|(_, value)| serde_json::from_slice::<ItemId>(value))
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::from)?;
    let slot_keys = ids
        .iter()
        .map(|id| slot_key(id))
        .collect::<Result<Vec<_>, _>>()?;
    let slots = store.get_many(&slot_keys).await?;

    let mut items = Vec::with_capacity(ids.len());
    for (id, slot) in ids.iter().zip(slots) {
        let slot = match slot {
            Some(bytes) => serde_json::from_slice::<ResponseSlot>(&bytes).map_err(StoreError::from)?,
            None => {
                tracing::error!("response slot of {} for request {} is missing", id, nonce);
                continue;
            }
        };
        match slot.payload {
            Some(payload) => items.push(payload),
            None => tracing::error!(
                "response slot of {} for request {} has no payload",
                id,
                nonce
            ),
        }
    }
    Ok((items, next))
}
