//! Bundling loop. One logical actor per replica set, elected per tick through
//! a TTL'd compare-and-set lock, drains the mempool into handleOps
//! transactions and drives bundle and operation lifecycles.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    common::{
        handle::Task,
        math, retry,
        types::{BundleRecord, BundleStatus, UserOpRecord, UserOpStatus, UserOperation},
    },
    entrypoint::{EntryPointLike, TransactionOverrides},
    kv::KeyValueStore,
    mempool::{Mempool, BUNDLE_LOCK_KEY},
    store::{BundleStore, BundleUpdate, UserOpStore, UserOpUpdate},
};

/// Base transaction cost charged per operation when sizing a bundle.
const PER_OP_BASE_GAS: u64 = 21_000;

/// Bundle failure messages are truncated to fit the error column.
const MAX_ERROR_LEN: usize = 255;

#[derive(Clone, Copy, Debug)]
pub struct BundlerSettings {
    /// Fee recipient passed to handleOps.
    pub beneficiary: Address,
    pub bundle_interval: Duration,
    pub max_ops_per_bundle: usize,
    pub max_bundle_gas: u64,
    /// How long to wait for a bundle transaction receipt before giving up.
    pub tx_timeout: Duration,
    pub lock_ttl: Duration,
    /// Applied to the provider's fee estimates.
    pub fee_bump_percent: u64,
    /// Applied to the estimated bundle gas limit.
    pub gas_buffer_percent: u64,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            beneficiary: Address::zero(),
            bundle_interval: Duration::from_secs(5),
            max_ops_per_bundle: 10,
            max_bundle_gas: 10_000_000,
            tx_timeout: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(30),
            fee_bump_percent: 20,
            gas_buffer_percent: 20,
        }
    }
}

/// Snapshot of the bundler shared with the RPC and health surfaces.
#[derive(Clone, Debug, Default)]
pub struct BundlerStatus {
    pub is_running: bool,
    pub last_bundle_id: Option<Uuid>,
    pub last_bundle_time: Option<DateTime<Utc>>,
}

pub type SharedBundlerStatus = Arc<RwLock<BundlerStatus>>;

pub struct BundlerTask<M, E, K, B, S> {
    settings: BundlerSettings,
    mempool: Arc<M>,
    entry_point: Arc<E>,
    kv: Arc<K>,
    bundles: Arc<B>,
    user_ops: Arc<S>,
    status: SharedBundlerStatus,
}

#[async_trait]
impl<M, E, K, B, S> Task for BundlerTask<M, E, K, B, S>
where
    M: Mempool,
    E: EntryPointLike,
    K: KeyValueStore,
    B: BundleStore,
    S: UserOpStore,
{
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        info!(
            "Starting bundler with interval {:?}, max {} ops per bundle",
            self.settings.bundle_interval, self.settings.max_ops_per_bundle
        );
        self.status.write().is_running = true;
        let mut interval = tokio::time::interval(self.settings.bundle_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!("Bundler tick failed: {err:#}");
                    }
                }
                _ = shutdown_token.cancelled() => break,
            }
        }
        self.status.write().is_running = false;
        info!("Bundler stopped");
        Ok(())
    }
}

impl<M, E, K, B, S> BundlerTask<M, E, K, B, S>
where
    M: Mempool,
    E: EntryPointLike,
    K: KeyValueStore,
    B: BundleStore,
    S: UserOpStore,
{
    pub fn new(
        settings: BundlerSettings,
        mempool: Arc<M>,
        entry_point: Arc<E>,
        kv: Arc<K>,
        bundles: Arc<B>,
        user_ops: Arc<S>,
        status: SharedBundlerStatus,
    ) -> Self {
        Self {
            settings,
            mempool,
            entry_point,
            kv,
            bundles,
            user_ops,
            status,
        }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }

    /// One bundling attempt. The lock gates the whole tick and is released on
    /// every exit path; a crashed holder is bounded by the lock TTL.
    async fn tick(&self) -> anyhow::Result<()> {
        let lock_value = Uuid::new_v4().to_string();
        let acquired = self
            .kv
            .set_nx(BUNDLE_LOCK_KEY, &lock_value, self.settings.lock_ttl)
            .await?;
        if !acquired {
            debug!("Bundle lock held elsewhere, skipping tick");
            return Ok(());
        }
        let result = self.bundle_once().await;
        if let Err(err) = self.kv.delete(BUNDLE_LOCK_KEY).await {
            warn!("Failed to release bundle lock: {err:#}");
        }
        result
    }

    async fn bundle_once(&self) -> anyhow::Result<()> {
        // Leader-only housekeeping of cache entries whose rows went terminal.
        if let Err(err) = self.mempool.sweep().await {
            warn!("Mempool sweep failed: {err:#}");
        }

        let ops = self
            .mempool
            .pending_operations(self.settings.max_ops_per_bundle)
            .await?;
        if ops.is_empty() {
            debug!("No pending operations to bundle");
            return Ok(());
        }

        let bundle_id = Uuid::new_v4();
        let hashes: Vec<H256> = ops.iter().map(|record| record.hash).collect();
        self.bundles
            .insert(&BundleRecord::new(bundle_id, Utc::now()))
            .await?;
        self.user_ops
            .update_by_hashes(
                &hashes,
                UserOpUpdate {
                    bundle_id: Some(bundle_id),
                    ..UserOpUpdate::default()
                },
            )
            .await?;
        {
            let mut status = self.status.write();
            status.last_bundle_id = Some(bundle_id);
            status.last_bundle_time = Some(Utc::now());
        }
        info!("Created bundle {bundle_id} with {} operations", ops.len());

        match self.submit_bundle(bundle_id, &ops, &hashes).await {
            Ok(block_number) => {
                BundlerMetrics::increment_bundles_confirmed(ops.len());
                info!("Bundle {bundle_id} confirmed in block {block_number}");
            }
            Err(err) => {
                BundlerMetrics::increment_bundles_failed();
                warn!("Bundle {bundle_id} failed: {err:#}");
                self.fail_bundle(bundle_id, &hashes, &err).await;
            }
        }
        Ok(())
    }

    /// Steps 4-8 of the tick: size the bundle, bump fees, submit, and wait
    /// for the receipt. Returns the confirmation block number.
    async fn submit_bundle(
        &self,
        bundle_id: Uuid,
        ops: &[UserOpRecord],
        hashes: &[H256],
    ) -> anyhow::Result<u64> {
        let gas_limit = self.bundle_gas_limit(ops);
        // Fee reads are safe to retry; the submission itself is not, since a
        // replayed send could double-spend the signer nonce.
        let fees = retry::with_retries(
            "fetch chain fee data",
            || self.entry_point.fee_data(),
            retry::RetryOpts::default(),
        )
        .await
        .context("should fetch chain fee data")?
        .increase_by_percent(self.settings.fee_bump_percent);
        let overrides = TransactionOverrides {
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            gas_limit,
        };
        let user_ops: Vec<UserOperation> = ops.iter().map(|record| record.op.clone()).collect();

        let tx_hash = self
            .entry_point
            .handle_ops(user_ops, self.settings.beneficiary, overrides)
            .await
            .context("should submit bundle transaction")?;
        BundlerMetrics::increment_bundles_submitted();
        info!("Bundle {bundle_id} submitted as {tx_hash:?}");

        self.bundles
            .update(
                bundle_id,
                BundleUpdate {
                    status: Some(BundleStatus::Submitted),
                    transaction_hash: Some(tx_hash),
                    ..BundleUpdate::default()
                },
            )
            .await?;
        self.user_ops
            .update_by_hashes(
                hashes,
                UserOpUpdate {
                    status: Some(UserOpStatus::Submitted),
                    transaction_hash: Some(tx_hash),
                    ..UserOpUpdate::default()
                },
            )
            .await?;
        // Submitted operations are no longer inclusion candidates.
        if let Err(err) = self.mempool.remove_from_cache(hashes).await {
            warn!("Failed to evict submitted ops from cache: {err:#}");
        }

        let receipt = self
            .entry_point
            .wait_for_receipt(tx_hash, self.settings.tx_timeout)
            .await
            .context("should poll for bundle receipt")?;
        let Some(receipt) = receipt else {
            bail!("timed out waiting for receipt of {tx_hash:?}");
        };
        if receipt.status != Some(1.into()) {
            bail!("bundle transaction {tx_hash:?} reverted");
        }
        let block_number = receipt
            .block_number
            .context("mined receipt should carry a block number")?
            .as_u64();

        self.bundles
            .update(
                bundle_id,
                BundleUpdate {
                    status: Some(BundleStatus::Confirmed),
                    block_number: Some(block_number),
                    ..BundleUpdate::default()
                },
            )
            .await?;
        self.user_ops
            .update_by_hashes(
                hashes,
                UserOpUpdate {
                    status: Some(UserOpStatus::Confirmed),
                    block_number: Some(block_number),
                    ..UserOpUpdate::default()
                },
            )
            .await?;
        Ok(block_number)
    }

    /// Failure attribution: the bundle and its operations are marked failed
    /// and dropped from the cache. Failed operations do not retry; clients
    /// must resubmit.
    async fn fail_bundle(&self, bundle_id: Uuid, hashes: &[H256], error: &anyhow::Error) {
        let message: String = format!("{error:#}").chars().take(MAX_ERROR_LEN).collect();
        if let Err(err) = self
            .bundles
            .update(
                bundle_id,
                BundleUpdate {
                    status: Some(BundleStatus::Failed),
                    error: Some(message.clone()),
                    ..BundleUpdate::default()
                },
            )
            .await
        {
            error!("Failed to mark bundle {bundle_id} failed: {err:#}");
        }
        if let Err(err) = self
            .user_ops
            .update_by_hashes(
                hashes,
                UserOpUpdate {
                    status: Some(UserOpStatus::Failed),
                    error: Some(message),
                    ..UserOpUpdate::default()
                },
            )
            .await
        {
            error!("Failed to mark bundle {bundle_id} ops failed: {err:#}");
        }
        if let Err(err) = self.mempool.remove_from_cache(hashes).await {
            warn!("Failed to evict failed ops from cache: {err:#}");
        }
    }

    /// Σ(verificationGasLimit + callGasLimit) + 21,000 per op, buffered, then
    /// capped at the configured bundle maximum.
    fn bundle_gas_limit(&self, ops: &[UserOpRecord]) -> U256 {
        let mut total = U256::from(PER_OP_BASE_GAS) * ops.len() as u64;
        for record in ops {
            total = total + record.op.verification_gas_limit + record.op.call_gas_limit;
        }
        let buffered = math::increase_by_percent(total, self.settings.gas_buffer_percent);
        buffered.min(U256::from(self.settings.max_bundle_gas))
    }
}

struct BundlerMetrics {}

impl BundlerMetrics {
    fn increment_bundles_submitted() {
        metrics::increment_counter!("bundler_bundles_submitted");
    }

    fn increment_bundles_confirmed(op_count: usize) {
        metrics::increment_counter!("bundler_bundles_confirmed");
        metrics::counter!("bundler_ops_confirmed", op_count as u64);
    }

    fn increment_bundles_failed() {
        metrics::increment_counter!("bundler_bundles_failed");
    }
}
