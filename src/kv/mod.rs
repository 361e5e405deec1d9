//! Key-value cache port. The mempool uses it for hot lookups by hash, the
//! sender/nonce conflict index, and the bundle lock; all entries carry TTLs.

mod redis;

#[cfg(test)]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub use self::redis::RedisStore;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Writes several keys in one atomic pipeline, all with the same TTL.
    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> anyhow::Result<()>;

    /// Sets the key only if it does not already exist, with a TTL. Returns
    /// whether the key was set. This is the compare-and-set primitive behind
    /// the bundle lock.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Removes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()>;

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()>;

    async fn zcard(&self, key: &str) -> anyhow::Result<u64>;

    async fn zscore(&self, key: &str, member: &str) -> anyhow::Result<Option<i64>>;

    /// Members with scores in [min, max], ascending, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;

    async fn ping(&self) -> anyhow::Result<()>;
}
