//! Validated user operation mempool: the single source of truth for which
//! operations are candidates for inclusion in the next bundle.

pub mod error;
mod uo_mempool;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
#[cfg(test)]
use mockall::automock;

pub use uo_mempool::{PoolConfig, UoMempool};

use crate::common::types::{UserOpRecord, UserOperation};
use error::MempoolResult;

/// Sorted-set of pending op hashes scored by admission time (epoch millis).
pub const MEMPOOL_INDEX_KEY: &str = "mempool:index";

/// Holder of this key is the bundling leader across the replica set.
pub const BUNDLE_LOCK_KEY: &str = "bundle:lock";

pub fn op_key(hash: H256) -> String {
    format!("mempool:{hash:?}")
}

pub fn sender_nonce_key(sender: Address, nonce: U256) -> String {
    format!("senderNonce:{sender:?}:{nonce}")
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Mempool: Send + Sync + 'static {
    fn entry_point(&self) -> Address;

    /// Validates and admits an operation, deduplicating by hash and applying
    /// the fee-bump replacement rule on sender/nonce conflicts. Returns the
    /// durable record, which for a duplicate is the existing one.
    async fn add_operation(&self, op: UserOperation) -> MempoolResult<UserOpRecord>;

    /// Looks up an operation by hash, serving the cached payload when the
    /// operation is still pending and falling through to the durable store.
    async fn get_operation(&self, hash: H256) -> MempoolResult<Option<UserOpRecord>>;

    /// Pending operations in admission order, oldest first.
    async fn pending_operations(&self, limit: usize) -> MempoolResult<Vec<UserOpRecord>>;

    /// Evicts the operation from the cache and marks its row removed.
    /// Returns false when no pending operation with this hash exists.
    async fn remove_operation(&self, hash: H256) -> MempoolResult<bool>;

    /// Drops cache entries for operations that have left the pending state;
    /// their durable rows are untouched.
    async fn remove_from_cache(&self, hashes: &[H256]) -> MempoolResult<()>;

    /// Number of operations currently indexed in the cache.
    async fn size(&self) -> MempoolResult<u64>;

    /// Admin-only purge of every cache entry. Durable rows are untouched.
    async fn clear(&self) -> MempoolResult<()>;

    /// Evicts cache entries whose backing rows are terminal or whose TTL has
    /// lapsed. The durable store always wins on divergence.
    async fn sweep(&self) -> MempoolResult<()>;
}
