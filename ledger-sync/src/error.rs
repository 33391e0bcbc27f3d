//! Top level error module for the crate

use crate::primitives::Nonce;

/// Top level error enum encapsulating any error that may occur during sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Errors associated with the remote ledger
    #[error("server error. {0}")]
    ServerError(#[from] ServerError),
    /// Errors associated with the storage engine
    #[error("store error. {0}")]
    StoreError(#[from] StoreError),
    /// A request nonce was referenced that the coordinator has no record of.
    #[error("unknown request nonce {0}")]
    UnknownNonce(Nonce),
    /// An operation referenced an account that is not tracked.
    #[error("account {0} is not tracked")]
    AccountNotTracked(String),
    /// The consumer handler failed to process a date range.
    #[error("consumer error. {0}")]
    ConsumerError(String),
    /// The consumer returned without draining the response stream.
    #[error("response stream for nonce {0} was not drained by the consumer")]
    UndrainedResponse(Nonce),
    /// The coordinator was dropped while a caller waited for completion.
    #[error("coordinator stopped before nonce {0} completed")]
    CoordinatorStopped(Nonce),
}

/// Server errors.
///
/// Errors associated with connecting to the remote ledger and receiving invalid data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    /// Server request failed.
    #[error("server request failed. {0}")]
    RequestFailed(String),
    /// Server did not answer in time.
    #[error("server request timed out")]
    Timeout,
    /// Server is rate limiting this client.
    #[error("server is rate limiting requests")]
    RateLimited,
    /// Server returned data that could not be interpreted.
    #[error("server returned invalid data. {0}")]
    InvalidResponse(String),
    /// No fallback node is configured but the job asked for one.
    #[error("no fallback rpc configured")]
    NoFallback,
}

impl ServerError {
    /// Transient errors are absorbed by retry budgets, everything else surfaces from the job run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited)
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record could not be encoded or decoded.
    #[error("failed to encode or decode record. {0}")]
    Encoding(#[from] serde_json::Error),
    /// A string key component does not fit the fixed key width.
    #[error("key component is {len} bytes, maximum is {max}")]
    KeyComponentTooLong {
        /// Length of the rejected component
        len: usize,
        /// Fixed width of string components
        max: usize,
    },
    /// A string key component contains a zero byte, which is reserved for padding.
    #[error("key component contains a zero byte")]
    KeyComponentContainsNul,
    /// The storage backend failed.
    #[error("storage backend failure. {0}")]
    Backend(String),
}
