#![warn(missing_docs)]
//! Status enums shared by the ledger sync engine and its storage records.

pub mod coverage_state;
pub mod job_direction;
pub mod rpc_tier;
