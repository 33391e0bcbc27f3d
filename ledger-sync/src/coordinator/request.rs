//! Records of the range request protocol.

use std::collections::{BTreeMap, BTreeSet};

use futures::StreamExt;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::{
    error::SyncError,
    interface::{FetchControl, IdBatchStream},
    primitives::{DateRange, ItemId, LedgerItem, Nonce},
};

/// Ordinal of an item matched by a request before it was registered with it. Sorts after
/// every registered item.
pub(crate) const UNREGISTERED_ORDINAL: u64 = u64::MAX;

/// The kinds of range request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestParams {
    /// exact id set, known by the caller
    ByIds { ids: BTreeSet<ItemId> },
    /// every item of an account timestamped within the range
    ByDateRange { account: String, range: DateRange },
}

impl RequestParams {
    pub fn by_ids<I: IntoIterator<Item = ItemId>>(ids: I) -> Self {
        Self::ByIds {
            ids: ids.into_iter().collect(),
        }
    }

    /// Whether a delivered item answers this request.
    pub fn matches(&self, item: &LedgerItem) -> bool {
        match self {
            Self::ByIds { ids } => ids.contains(item.id()),
            Self::ByDateRange { account, range } => {
                item.account() == account && range.contains(item.timestamp())
            }
        }
    }

    /// The ids answering this request. By-id requests already know them, date range
    /// requests scan the fetch subsystem's index lazily.
    pub(crate) async fn id_batches(
        &self,
        fetch: &dyn FetchControl,
    ) -> Result<IdBatchStream, SyncError> {
        match self {
            Self::ByIds { ids } => {
                let ids: Vec<ItemId> = ids.iter().cloned().collect();
                Ok(futures::stream::iter([Ok(ids)]).boxed())
            }
            Self::ByDateRange { account, range } => {
                fetch.fetch_by_date_range(account, *range).await
            }
        }
    }
}

impl std::fmt::Display for RequestParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByIds { ids } => write!(f, "{} ids", ids.len()),
            Self::ByDateRange { account, range } => write!(f, "{account} {range}"),
        }
    }
}

/// A request for items, identified by its nonce.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct RangeRequest {
    #[getset(get_copy = "pub")]
    nonce: Nonce,
    #[getset(get = "pub")]
    params: RequestParams,
    #[getset(get_copy = "pub")]
    pub(crate) complete: bool,
    #[getset(get_copy = "pub")]
    created_at: u64,
}

impl RangeRequest {
    pub(crate) fn new(nonce: Nonce, params: RequestParams, created_at: u64) -> Self {
        Self {
            nonce,
            params,
            complete: false,
            created_at,
        }
    }
}

/// An item still outstanding for the requests in `nonces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingItem {
    pub(crate) id: ItemId,
    pub(crate) nonces: BTreeSet<Nonce>,
}

impl PendingItem {
    pub(crate) fn new(id: ItemId) -> Self {
        Self {
            id,
            nonces: BTreeSet::new(),
        }
    }
}

/// Response bookkeeping of one item, shared by every request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ResponseSlot {
    pub(crate) id: ItemId,
    /// position of the item within each request
    pub(crate) nonce_indexes: BTreeMap<Nonce, u64>,
    pub(crate) payload: Option<LedgerItem>,
}

impl ResponseSlot {
    pub(crate) fn new(id: ItemId) -> Self {
        Self {
            id,
            nonce_indexes: BTreeMap::new(),
            payload: None,
        }
    }

    /// `true` once the payload arrived for a request holding `nonce`.
    pub(crate) fn is_filled_for(&self, nonce: Nonce) -> bool {
        self.payload.is_some() && self.nonce_indexes.contains_key(&nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::mock_item;

    #[test]
    fn by_ids_matches_exact_membership() {
        let params = RequestParams::by_ids(["acc-1".to_string(), "acc-3".to_string()]);
        assert!(params.matches(&mock_item("acc", 1)));
        assert!(!params.matches(&mock_item("acc", 2)));
    }

    #[test]
    fn by_date_range_matches_account_and_window() {
        let params = RequestParams::ByDateRange {
            account: "acc".to_string(),
            range: DateRange::new(2000, 4000),
        };
        assert!(params.matches(&mock_item("acc", 2)));
        assert!(params.matches(&mock_item("acc", 3)));
        assert!(!params.matches(&mock_item("acc", 4)));
        assert!(!params.matches(&mock_item("other", 3)));
    }
}
