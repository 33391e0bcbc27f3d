//! Module for handling all connections to the remote ledger

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ledger_status::rpc_tier::RpcTier;

use crate::{
    error::ServerError,
    primitives::{ItemId, ItemRef, LedgerItem, PaginationCursor},
};

pub mod fetch;

/// Request for one page of an account's history.
///
/// Pages are returned newest first. `before` excludes everything at or after its position,
/// `until` asks the server to stop at its position. Servers are not trusted to honour `until`
/// exactly, callers check it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub address: String,
    pub before: Option<PaginationCursor>,
    pub until: Option<PaginationCursor>,
    pub limit: usize,
}

/// One page of history in descending position order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<ItemRef>,
    /// newest item of the page
    pub first_key: Option<PaginationCursor>,
    /// oldest item of the page, the `before` cursor of the next page
    pub last_key: Option<PaginationCursor>,
}

impl Page {
    /// Builds a page from items in descending order, deriving both keys.
    pub fn from_items(items: Vec<ItemRef>) -> Self {
        let first_key = items.first().map(ItemRef::cursor);
        let last_key = items.last().map(ItemRef::cursor);
        Self {
            items,
            first_key,
            last_key,
        }
    }
}

/// Paginated history API of the remote ledger.
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Fetches one page of history for `request.address`.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, ServerError>;

    /// Fetches full payloads. Ids unknown to the server are omitted from the result.
    async fn fetch_items(&self, ids: &[ItemId]) -> Result<Vec<LedgerItem>, ServerError>;
}

/// The remote endpoints available to the engine.
#[derive(Clone)]
pub struct LedgerClients {
    primary: Arc<dyn RemoteLedger>,
    fallback: Option<Arc<dyn RemoteLedger>>,
}

impl LedgerClients {
    pub fn new(primary: Arc<dyn RemoteLedger>, fallback: Option<Arc<dyn RemoteLedger>>) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &Arc<dyn RemoteLedger> {
        &self.primary
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Returns the endpoint of `tier`.
    pub fn for_tier(&self, tier: RpcTier) -> Result<&Arc<dyn RemoteLedger>, ServerError> {
        match tier {
            RpcTier::Primary => Ok(&self.primary),
            RpcTier::Fallback => self.fallback.as_ref().ok_or(ServerError::NoFallback),
        }
    }
}
