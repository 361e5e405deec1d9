use std::sync::Arc;

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    bundler::SharedBundlerStatus, entrypoint::EntryPointLike, kv::KeyValueStore,
    store::PostgresStore,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

/// Per-dependency probe results.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    pub database: bool,
    pub cache: bool,
    pub rpc: bool,
    pub bundler_balance: bool,
    pub bundler_running: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_bundle_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_bundle_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

#[rpc(server, namespace = "system")]
pub trait SystemApi {
    /// Full health snapshot, proxied from GET /health.
    #[method(name = "health")]
    async fn get_health(&self) -> RpcResult<HealthSnapshot>;

    /// Readiness, proxied from GET /ready.
    #[method(name = "ready")]
    async fn get_ready(&self) -> RpcResult<HealthSnapshot>;

    /// Liveness, proxied from GET /live.
    #[method(name = "live")]
    async fn get_live(&self) -> RpcResult<String>;
}

/// Probes every dependency the service needs to make progress: the durable
/// store, the cache, the EVM endpoint, and the signer balance.
pub struct HealthChecker<E, K> {
    db: PostgresStore,
    kv: Arc<K>,
    entry_point: Arc<E>,
    signer_address: Address,
    min_signer_balance: U256,
    bundler_status: SharedBundlerStatus,
}

impl<E, K> HealthChecker<E, K>
where
    E: EntryPointLike,
    K: KeyValueStore,
{
    pub fn new(
        db: PostgresStore,
        kv: Arc<K>,
        entry_point: Arc<E>,
        signer_address: Address,
        min_signer_balance: U256,
        bundler_status: SharedBundlerStatus,
    ) -> Self {
        Self {
            db,
            kv,
            entry_point,
            signer_address,
            min_signer_balance,
            bundler_status,
        }
    }

    async fn snapshot(&self) -> HealthSnapshot {
        let database = match self.db.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("Database health check failed: {err:#}");
                false
            }
        };
        let cache = match self.kv.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("Cache health check failed: {err:#}");
                false
            }
        };
        let (rpc, bundler_balance) =
            match self.entry_point.get_balance(self.signer_address).await {
                Ok(balance) => (true, balance >= self.min_signer_balance),
                Err(err) => {
                    warn!("EVM RPC health check failed: {err:#}");
                    (false, false)
                }
            };
        let bundler = self.bundler_status.read().clone();

        let checks = HealthChecks {
            database,
            cache,
            rpc,
            bundler_balance,
            bundler_running: bundler.is_running,
        };
        let status = if !(database && cache && rpc) {
            HealthStatus::Unhealthy
        } else if !(bundler_balance && bundler.is_running) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };

        HealthSnapshot {
            status,
            checks,
            last_bundle_id: bundler.last_bundle_id,
            last_bundle_time: bundler.last_bundle_time,
            timestamp: Utc::now(),
        }
    }
}

#[jsonrpsee::core::async_trait]
impl<E, K> SystemApiServer for HealthChecker<E, K>
where
    E: EntryPointLike,
    K: KeyValueStore,
{
    async fn get_health(&self) -> RpcResult<HealthSnapshot> {
        Ok(self.snapshot().await)
    }

    async fn get_ready(&self) -> RpcResult<HealthSnapshot> {
        Ok(self.snapshot().await)
    }

    async fn get_live(&self) -> RpcResult<String> {
        Ok("ok".to_string())
    }
}
