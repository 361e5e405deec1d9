use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use jsonrpsee::{
    server::{middleware::proxy_get_request::ProxyGetRequestLayer, ServerBuilder},
    RpcModule,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    eth::EthApiServer, health::SystemApiServer, metrics::RpcMetricsLogger, EthApi, HealthChecker,
    RateLimiter,
};
use crate::{
    bundler::SharedBundlerStatus,
    common::handle::Task,
    entrypoint::EntryPointLike,
    kv::KeyValueStore,
    mempool::Mempool,
    store::PostgresStore,
};

#[derive(Clone, Debug)]
pub struct Args {
    pub host: String,
    pub port: u16,
    pub chain_id: u64,
    pub signer_address: Address,
    pub min_signer_balance: U256,
    pub rpc_timeout: Duration,
    pub max_connections: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
}

pub struct RpcTask<M, E, K> {
    args: Args,
    mempool: Arc<M>,
    entry_point: Arc<E>,
    kv: Arc<K>,
    db: PostgresStore,
    bundler_status: SharedBundlerStatus,
}

#[async_trait]
impl<M, E, K> Task for RpcTask<M, E, K>
where
    M: Mempool,
    E: EntryPointLike,
    K: KeyValueStore,
{
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.args.host, self.args.port)
            .parse()
            .context("invalid RPC listen address")?;
        info!("Starting rpc server on {addr}");

        let rate_limiter = Arc::new(RateLimiter::new(
            self.args.rate_limit_window,
            self.args.rate_limit_max_requests,
        ));

        let mut module = RpcModule::new(());
        module.merge(
            EthApi::new(
                self.args.chain_id,
                self.mempool.clone(),
                self.entry_point.clone(),
                self.bundler_status.clone(),
                rate_limiter,
            )
            .into_rpc(),
        )?;
        module.merge(
            HealthChecker::new(
                self.db.clone(),
                self.kv.clone(),
                self.entry_point.clone(),
                self.args.signer_address,
                self.args.min_signer_balance,
                self.bundler_status.clone(),
            )
            .into_rpc(),
        )?;

        // Operator endpoints are plain GETs proxied onto the system namespace.
        let service_builder = tower::ServiceBuilder::new()
            .layer(ProxyGetRequestLayer::new("/health", "system_health")?)
            .layer(ProxyGetRequestLayer::new("/ready", "system_ready")?)
            .layer(ProxyGetRequestLayer::new("/live", "system_live")?)
            .timeout(self.args.rpc_timeout);

        let server = ServerBuilder::default()
            .set_logger(RpcMetricsLogger)
            .set_middleware(service_builder)
            .max_connections(self.args.max_connections)
            .http_only()
            .build(addr)
            .await?;
        let handle = server.start(module)?;

        info!("Started RPC server");

        tokio::select! {
            _ = handle.stopped() => {
                bail!("RPC server stopped unexpectedly")
            }
            _ = shutdown_token.cancelled() => {
                info!("RPC server shutdown");
                Ok(())
            }
        }
    }
}

impl<M, E, K> RpcTask<M, E, K>
where
    M: Mempool,
    E: EntryPointLike,
    K: KeyValueStore,
{
    pub fn new(
        args: Args,
        mempool: Arc<M>,
        entry_point: Arc<E>,
        kv: Arc<K>,
        db: PostgresStore,
        bundler_status: SharedBundlerStatus,
    ) -> Self {
        Self {
            args,
            mempool,
            entry_point,
            kv,
            db,
            bundler_status,
        }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}
