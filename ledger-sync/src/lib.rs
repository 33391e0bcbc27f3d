#![warn(missing_docs)]
//! Incremental ledger sync engine
//!
//! Walks the paginated history of tracked accounts with forward and backward cursor jobs,
//! correlates requested items with nonces, and hands gap-free date ranges to consumers.
//!
//! Entrypoint: [`crate::sync::SyncEngine`]

#[allow(missing_docs)]
pub mod client;
#[allow(missing_docs)]
pub mod config;
#[allow(missing_docs)]
pub mod coordinator;
#[allow(missing_docs)]
pub mod coverage;
pub mod error;
#[allow(missing_docs)]
pub mod fetcher;
#[allow(missing_docs)]
pub mod interface;
#[allow(missing_docs)]
pub mod interval;
#[cfg(any(test, feature = "test-features"))]
#[allow(missing_docs)]
pub mod mocks;
#[allow(missing_docs)]
pub mod primitives;
#[allow(missing_docs)]
pub mod queue;
#[allow(missing_docs)]
pub mod scheduler;
#[allow(missing_docs)]
pub mod store;
pub mod sync;
#[allow(missing_docs)]
pub mod task;
pub(crate) mod utils;
