//! Durable persistence ports. The relational store is the source of truth for
//! user operations and bundles; rows are updated in place and never deleted.

mod postgres;

use async_trait::async_trait;
use ethers::types::H256;
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

pub use postgres::PostgresStore;

use crate::common::types::{BundleRecord, BundleStatus, UserOpRecord, UserOpStatus};

/// Partial update applied to user operation rows. `status` is always written;
/// the optional fields are only written when present.
#[derive(Clone, Debug, Default)]
pub struct UserOpUpdate {
    pub status: Option<UserOpStatus>,
    pub bundle_id: Option<Uuid>,
    pub transaction_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
}

impl UserOpUpdate {
    pub fn status(status: UserOpStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Partial update applied to a bundle row.
#[derive(Clone, Debug, Default)]
pub struct BundleUpdate {
    pub status: Option<BundleStatus>,
    pub transaction_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
}

impl BundleUpdate {
    pub fn status(status: BundleStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserOpStore: Send + Sync + 'static {
    /// Inserts a new row. A concurrent insert of the same hash is not an
    /// error; the unique index keeps exactly one row per hash.
    async fn insert(&self, record: &UserOpRecord) -> anyhow::Result<()>;

    async fn get_by_hash(&self, hash: H256) -> anyhow::Result<Option<UserOpRecord>>;

    async fn get_by_hashes(&self, hashes: &[H256]) -> anyhow::Result<Vec<UserOpRecord>>;

    /// Pending operations in admission order (ascending submitted_at).
    async fn list_pending(&self, limit: usize) -> anyhow::Result<Vec<UserOpRecord>>;

    /// Applies the update to every row matching the given hashes, returning
    /// the number of rows touched. Rows are located by hash, not by id.
    async fn update_by_hashes(&self, hashes: &[H256], update: UserOpUpdate)
        -> anyhow::Result<u64>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleStore: Send + Sync + 'static {
    async fn insert(&self, record: &BundleRecord) -> anyhow::Result<()>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<BundleRecord>>;

    async fn update(&self, id: Uuid, update: BundleUpdate) -> anyhow::Result<()>;
}
