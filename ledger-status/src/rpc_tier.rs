//! An RPC endpoint can be:
//!  Primary === the node the job normally talks to
//!  Fallback === a degraded or public node, only used once the primary stops yielding history

use serde::{Deserialize, Serialize};

/// Which remote endpoint a job is currently paging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcTier {
    /// The configured primary node.
    #[default]
    Primary,
    /// The fallback node. A backward job that runs dry here is considered to have reached genesis.
    Fallback,
}

impl RpcTier {
    /// A wrapper matching the Fallback case.
    /// # Examples
    ///
    /// ```
    /// use ledger_status::rpc_tier::RpcTier;
    ///
    /// assert!(!RpcTier::Primary.is_fallback());
    /// assert!(RpcTier::Fallback.is_fallback());
    /// ```
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }
}

impl std::fmt::Display for RpcTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary rpc"),
            Self::Fallback => write!(f, "fallback rpc"),
        }
    }
}
