use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256};
use tracing::{debug, info, warn};

use super::{
    error::{MempoolError, MempoolResult},
    op_key, sender_nonce_key, Mempool, MEMPOOL_INDEX_KEY,
};
use crate::{
    common::{
        math,
        types::{UserOpRecord, UserOpStatus, UserOperation},
    },
    entrypoint::EntryPointLike,
    kv::KeyValueStore,
    store::{UserOpStore, UserOpUpdate},
};

/// Cache entries swept per housekeeping pass.
const SWEEP_BATCH: usize = 256;

/// Minimum priority-fee increase for a replacement to supersede its
/// incumbent, in percent.
const REPLACEMENT_FEE_INCREASE_PERCENT: u64 = 10;

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub entry_point: Address,
    pub chain_id: u64,
    /// Admission fails once this many operations are pending.
    pub max_size: usize,
    /// TTL applied to every cache entry.
    pub ttl: Duration,
}

/// Mempool over a durable store and a TTL'd cache. The durable store is
/// authoritative; the cache indexes pending operations by hash and by
/// (sender, nonce) for conflict detection.
pub struct UoMempool<E, K, S> {
    config: PoolConfig,
    entry_point: Arc<E>,
    kv: Arc<K>,
    store: Arc<S>,
}

impl<E, K, S> UoMempool<E, K, S>
where
    E: EntryPointLike,
    K: KeyValueStore,
    S: UserOpStore,
{
    pub fn new(config: PoolConfig, entry_point: Arc<E>, kv: Arc<K>, store: Arc<S>) -> Self {
        Self {
            config,
            entry_point,
            kv,
            store,
        }
    }

    /// Loads the pending incumbent for a sender/nonce index entry. A cache
    /// entry whose durable row is missing or no longer pending is stale and
    /// yields no incumbent.
    async fn load_incumbent(&self, hash: H256) -> MempoolResult<Option<UserOpRecord>> {
        let record = self.store.get_by_hash(hash).await?;
        Ok(record.filter(|record| record.status == UserOpStatus::Pending))
    }

    /// The fee-bump rule: a candidate replaces its incumbent only by raising
    /// the priority fee at least 10% without lowering the fee cap. All math
    /// is integer arithmetic on 256-bit values.
    fn check_replacement_fees(
        &self,
        incumbent: &UserOperation,
        candidate: &UserOperation,
    ) -> MempoolResult<()> {
        let required_priority_fee = math::increase_by_percent(
            incumbent.max_priority_fee_per_gas,
            REPLACEMENT_FEE_INCREASE_PERCENT,
        );
        if candidate.max_priority_fee_per_gas >= required_priority_fee
            && candidate.max_fee_per_gas >= incumbent.max_fee_per_gas
        {
            Ok(())
        } else {
            Err(MempoolError::ReplacementUnderpriced(
                incumbent.max_priority_fee_per_gas,
                incumbent.max_fee_per_gas,
            ))
        }
    }

    /// Drops the cache entries for a record. The sender/nonce index is only
    /// cleared when it still points at this operation so an already-admitted
    /// replacement is not clobbered.
    async fn drop_cache_entries(&self, record: &UserOpRecord) -> MempoolResult<()> {
        let hash_text = format!("{:?}", record.hash);
        self.kv.delete(&op_key(record.hash)).await?;
        self.kv.zrem(MEMPOOL_INDEX_KEY, &hash_text).await?;
        let sn_key = sender_nonce_key(record.op.sender, record.op.nonce);
        if self.kv.get(&sn_key).await?.as_deref() == Some(hash_text.as_str()) {
            self.kv.delete(&sn_key).await?;
        }
        Ok(())
    }

    /// Writes the cache entries for a freshly admitted record.
    async fn cache_record(&self, record: &UserOpRecord) -> MempoolResult<()> {
        let hash_text = format!("{:?}", record.hash);
        let op_json = serde_json::to_string(&record.op).context("should serialize user op")?;
        self.kv
            .set_many(
                &[
                    (op_key(record.hash), op_json),
                    (
                        sender_nonce_key(record.op.sender, record.op.nonce),
                        hash_text.clone(),
                    ),
                ],
                self.config.ttl,
            )
            .await?;
        self.kv
            .zadd(
                MEMPOOL_INDEX_KEY,
                &hash_text,
                record.submitted_at.timestamp_millis(),
            )
            .await?;
        Ok(())
    }

    /// Removes the incumbent for a successful replacement: cache entries are
    /// dropped and the durable row is marked removed.
    async fn evict_replaced(&self, incumbent: &UserOpRecord) -> MempoolResult<()> {
        self.drop_cache_entries(incumbent).await?;
        self.store
            .update_by_hashes(
                &[incumbent.hash],
                UserOpUpdate::status(UserOpStatus::Removed),
            )
            .await?;
        MempoolMetrics::increment_ops_replaced();
        Ok(())
    }
}

#[async_trait]
impl<E, K, S> Mempool for UoMempool<E, K, S>
where
    E: EntryPointLike,
    K: KeyValueStore,
    S: UserOpStore,
{
    fn entry_point(&self) -> Address {
        self.config.entry_point
    }

    async fn add_operation(&self, op: UserOperation) -> MempoolResult<UserOpRecord> {
        let hash = op.op_hash(self.config.entry_point, self.config.chain_id);

        // Identical payloads admit idempotently to the existing record.
        if let Some(existing) = self.store.get_by_hash(hash).await? {
            debug!("Operation {hash:?} already known");
            return Ok(existing);
        }

        let size = self.size().await?;
        if size >= self.config.max_size as u64 {
            MempoolMetrics::increment_ops_rejected("pool_full");
            return Err(MempoolError::PoolFull(self.config.max_size));
        }

        let sn_key = sender_nonce_key(op.sender, op.nonce);
        if let Some(incumbent_hash) = self.kv.get(&sn_key).await? {
            let incumbent_hash: H256 = incumbent_hash
                .parse()
                .context("invalid cached sender/nonce entry")?;
            if let Some(incumbent) = self.load_incumbent(incumbent_hash).await? {
                self.check_replacement_fees(&incumbent.op, &op)
                    .map_err(|err| {
                        MempoolMetrics::increment_ops_rejected("replacement_underpriced");
                        err
                    })?;
                info!(
                    "Replacing operation {incumbent_hash:?} for sender {:?} nonce {}",
                    op.sender, op.nonce
                );
                self.evict_replaced(&incumbent).await?;
            }
        }

        let validation = self.entry_point.simulate_validation(op.clone()).await?;
        if validation.signature_failed {
            MempoolMetrics::increment_ops_rejected("signature");
            return Err(MempoolError::SignatureCheckFailed);
        }

        let record = UserOpRecord::new(op, hash, Utc::now());
        self.store.insert(&record).await?;
        // Best-effort: the row is authoritative even if a cache write fails.
        self.cache_record(&record).await?;

        MempoolMetrics::increment_ops_admitted();
        MempoolMetrics::set_pool_size(self.size().await.unwrap_or(0));
        debug!("Admitted operation {hash:?}");
        Ok(record)
    }

    async fn get_operation(&self, hash: H256) -> MempoolResult<Option<UserOpRecord>> {
        if let Some(op_json) = self.kv.get(&op_key(hash)).await? {
            let op: UserOperation =
                serde_json::from_str(&op_json).context("should deserialize cached user op")?;
            let admitted_at = self
                .kv
                .zscore(MEMPOOL_INDEX_KEY, &format!("{hash:?}"))
                .await?
                .and_then(chrono::DateTime::from_timestamp_millis);
            if let Some(admitted_at) = admitted_at {
                return Ok(Some(UserOpRecord::new(op, hash, admitted_at)));
            }
        }
        Ok(self.store.get_by_hash(hash).await?)
    }

    async fn pending_operations(&self, limit: usize) -> MempoolResult<Vec<UserOpRecord>> {
        Ok(self.store.list_pending(limit).await?)
    }

    async fn remove_operation(&self, hash: H256) -> MempoolResult<bool> {
        let Some(record) = self.store.get_by_hash(hash).await? else {
            // Nothing durable; clear any dangling cache entry.
            self.kv.delete(&op_key(hash)).await?;
            self.kv.zrem(MEMPOOL_INDEX_KEY, &format!("{hash:?}")).await?;
            return Ok(false);
        };
        self.drop_cache_entries(&record).await?;
        if record.status != UserOpStatus::Pending {
            return Ok(false);
        }
        let updated = self
            .store
            .update_by_hashes(&[hash], UserOpUpdate::status(UserOpStatus::Removed))
            .await?;
        Ok(updated > 0)
    }

    async fn remove_from_cache(&self, hashes: &[H256]) -> MempoolResult<()> {
        let records = self.store.get_by_hashes(hashes).await?;
        for record in &records {
            self.drop_cache_entries(record).await?;
        }
        MempoolMetrics::set_pool_size(self.size().await.unwrap_or(0));
        Ok(())
    }

    async fn size(&self) -> MempoolResult<u64> {
        Ok(self.kv.zcard(MEMPOOL_INDEX_KEY).await?)
    }

    async fn clear(&self) -> MempoolResult<()> {
        let members = self
            .kv
            .zrange_by_score(MEMPOOL_INDEX_KEY, i64::MIN, i64::MAX, 100_000)
            .await?;
        let hashes: Vec<H256> = members
            .iter()
            .filter_map(|member| member.parse().ok())
            .collect();
        for record in self.store.get_by_hashes(&hashes).await? {
            self.kv.delete(&op_key(record.hash)).await?;
            self.kv
                .delete(&sender_nonce_key(record.op.sender, record.op.nonce))
                .await?;
        }
        // Entries without a backing row still need their keys dropped.
        for member in &members {
            self.kv.delete(&format!("mempool:{member}")).await?;
        }
        self.kv.delete(MEMPOOL_INDEX_KEY).await?;
        MempoolMetrics::set_pool_size(0);
        info!("Mempool cache cleared");
        Ok(())
    }

    async fn sweep(&self) -> MempoolResult<()> {
        // First pass: entries older than the TTL. Their string keys have
        // already lapsed; the index entry has not.
        let cutoff = Utc::now().timestamp_millis() - self.config.ttl.as_millis() as i64;
        let expired = self
            .kv
            .zrange_by_score(MEMPOOL_INDEX_KEY, i64::MIN, cutoff, SWEEP_BATCH)
            .await?;
        for member in &expired {
            self.kv.zrem(MEMPOOL_INDEX_KEY, member).await?;
        }

        // Second pass: entries whose backing row left the pending state.
        let members = self
            .kv
            .zrange_by_score(MEMPOOL_INDEX_KEY, i64::MIN, i64::MAX, SWEEP_BATCH)
            .await?;
        let hashes: Vec<H256> = members
            .iter()
            .filter_map(|member| member.parse().ok())
            .collect();
        let records = self.store.get_by_hashes(&hashes).await?;
        for record in &records {
            if record.status != UserOpStatus::Pending {
                warn!(
                    "Sweeping stale cache entry {:?} with status {}",
                    record.hash, record.status
                );
                self.drop_cache_entries(record).await?;
            }
        }
        let known: Vec<String> = records.iter().map(|r| format!("{:?}", r.hash)).collect();
        for member in &members {
            if !known.contains(member) {
                self.kv.delete(&format!("mempool:{member}")).await?;
                self.kv.zrem(MEMPOOL_INDEX_KEY, member).await?;
            }
        }
        MempoolMetrics::set_pool_size(self.size().await.unwrap_or(0));
        Ok(())
    }
}

struct MempoolMetrics {}

impl MempoolMetrics {
    fn increment_ops_admitted() {
        metrics::increment_counter!("mempool_ops_admitted");
    }

    fn increment_ops_replaced() {
        metrics::increment_counter!("mempool_ops_replaced");
    }

    fn increment_ops_rejected(reason: &'static str) {
        metrics::increment_counter!("mempool_ops_rejected", "reason" => reason);
    }

    fn set_pool_size(size: u64) {
        metrics::gauge!("mempool_size", size as f64);
    }
}
