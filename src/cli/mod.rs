//! Process entry: configuration, logging and metrics bootstrap, and the
//! composition root that wires the stores, adapter, mempool, bundler, and
//! RPC server together.

mod prometheus_exporter;

use std::{io, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, HttpRateLimitRetryPolicy, Middleware, Provider, RetryClientBuilder},
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use tokio::signal;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use url::Url;

use crate::{
    bundler::{BundlerSettings, BundlerTask, SharedBundlerStatus},
    common::handle::spawn_tasks_with_shutdown,
    entrypoint::EntryPoint,
    kv::RedisStore,
    mempool::{PoolConfig, UoMempool},
    rpc::{self, RpcTask},
    store::PostgresStore,
};

/// Main entry point for the CLI
///
/// Parses the CLI arguments, wires every component, and runs until a ctrl-c
/// signal asks the service to shut down.
pub async fn run() -> anyhow::Result<()> {
    let opt = Cli::parse();

    let (appender, _guard) = if let Some(log_file) = &opt.logs.file {
        tracing_appender::non_blocking(tracing_appender::rolling::never(".", log_file))
    } else {
        tracing_appender::non_blocking(io::stdout())
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(opt.logs.level.parse::<Level>()?)
        .with_writer(appender)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let metrics_addr = format!("{}:{}", opt.metrics.host, opt.metrics.port).parse()?;
    prometheus_exporter::initialize(metrics_addr)?;

    match opt.command {
        Command::Run(args) => run_bundler(args).await,
    }
}

async fn run_bundler(args: RunArgs) -> anyhow::Result<()> {
    let entry_point_address: Address = args
        .chain
        .entry_point
        .parse()
        .context("invalid entry point address")?;

    // Durable store and cache.
    let db = PostgresStore::connect(&args.database.database_url).await?;
    db.run_migrations().await?;
    let kv = Arc::new(RedisStore::connect(&args.database.redis_url).await?);

    // EVM provider with retrying transport and bounded call deadlines,
    // carrying the bundler signer.
    let parsed_url = Url::parse(&args.chain.eth_rpc_url).context("invalid ETH RPC URL")?;
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("should build HTTP client")?;
    let http = Http::new_with_client(parsed_url, http_client);
    let client = RetryClientBuilder::default()
        .rate_limit_retries(10)
        .timeout_retries(3)
        .initial_backoff(Duration::from_millis(500))
        .build(http, Box::<HttpRateLimitRetryPolicy>::default());
    let provider = Provider::new(client);

    let chain_id = provider
        .get_chainid()
        .await
        .context("should fetch chain id")?
        .as_u64();
    if chain_id != args.chain.chain_id {
        bail!(
            "chain id mismatch: node reports {chain_id}, configured {}",
            args.chain.chain_id
        );
    }

    let wallet: LocalWallet = args
        .bundler
        .private_key
        .parse::<LocalWallet>()
        .context("invalid bundler private key")?
        .with_chain_id(chain_id);
    let signer_address = wallet.address();
    let beneficiary = match &args.bundler.beneficiary {
        Some(address) => address.parse().context("invalid beneficiary address")?,
        None => signer_address,
    };
    let client = Arc::new(SignerMiddleware::new(provider, wallet));

    let entry_point = Arc::new(EntryPoint::new(entry_point_address, client));
    let mempool = Arc::new(UoMempool::new(
        PoolConfig {
            entry_point: entry_point_address,
            chain_id,
            max_size: args.bundler.max_mempool_size,
            ttl: Duration::from_millis(args.bundler.mempool_ttl_ms),
        },
        entry_point.clone(),
        kv.clone(),
        Arc::new(db.clone()),
    ));
    let bundler_status = SharedBundlerStatus::default();

    let bundler_task = BundlerTask::new(
        BundlerSettings {
            beneficiary,
            bundle_interval: Duration::from_millis(args.bundler.bundle_interval_ms),
            max_ops_per_bundle: args.bundler.max_ops_per_bundle,
            max_bundle_gas: args.bundler.max_bundle_gas,
            tx_timeout: Duration::from_millis(args.bundler.tx_timeout_ms),
            lock_ttl: Duration::from_millis(args.bundler.lock_ttl_ms),
            ..BundlerSettings::default()
        },
        mempool.clone(),
        entry_point.clone(),
        kv.clone(),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        bundler_status.clone(),
    );

    let rpc_task = RpcTask::new(
        rpc::Args {
            host: args.rpc.host.clone(),
            port: args.rpc.port,
            chain_id,
            signer_address,
            min_signer_balance: U256::from_dec_str(&args.bundler.min_signer_balance)
                .context("invalid min signer balance")?,
            rpc_timeout: Duration::from_secs(30),
            max_connections: args.rpc.max_connections,
            rate_limit_window: Duration::from_millis(args.rpc.rate_limit_window_ms),
            rate_limit_max_requests: args.rpc.rate_limit_max_requests,
        },
        mempool,
        entry_point,
        kv,
        db,
        bundler_status,
    );

    spawn_tasks_with_shutdown(
        vec![bundler_task.boxed(), rpc_task.boxed()],
        signal::ctrl_c(),
    )
    .await;
    tracing::info!("All components shutdown, goodbye");

    Ok(())
}

/// CLI options for the RPC server
#[derive(Args, Debug)]
#[command(next_help_heading = "RPC")]
struct RpcArgs {
    /// Port to listen on for JSON-RPC requests
    #[arg(long = "rpc.port", name = "rpc.port", env = "PORT", default_value = "3000")]
    port: u16,

    /// Host to listen on for JSON-RPC requests
    #[arg(
        long = "rpc.host",
        name = "rpc.host",
        env = "RPC_HOST",
        default_value = "0.0.0.0"
    )]
    host: String,

    /// Maximum concurrent connections
    #[arg(
        long = "rpc.max_connections",
        name = "rpc.max_connections",
        env = "RPC_MAX_CONNECTIONS",
        default_value = "100"
    )]
    max_connections: u32,

    /// Ingress throttle window in milliseconds
    #[arg(
        long = "rpc.rate_limit_window_ms",
        name = "rpc.rate_limit_window_ms",
        env = "RATE_LIMIT_WINDOW_MS",
        default_value = "60000"
    )]
    rate_limit_window_ms: u64,

    /// Requests allowed per throttle window; 0 disables throttling
    #[arg(
        long = "rpc.rate_limit_max_requests",
        name = "rpc.rate_limit_max_requests",
        env = "RATE_LIMIT_MAX_REQUESTS",
        default_value = "0"
    )]
    rate_limit_max_requests: u32,
}

/// CLI options for the durable store and cache
#[derive(Args, Debug)]
#[command(next_help_heading = "Storage")]
struct DatabaseArgs {
    /// Postgres DSN
    #[arg(
        long = "db.url",
        name = "db.url",
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/bundler"
    )]
    database_url: String,

    /// Redis DSN
    #[arg(
        long = "redis.url",
        name = "redis.url",
        env = "REDIS_URL",
        default_value = "redis://localhost:6379"
    )]
    redis_url: String,
}

/// CLI options for the chain connection
#[derive(Args, Debug)]
#[command(next_help_heading = "Chain")]
struct ChainArgs {
    /// EVM RPC endpoint
    #[arg(
        long = "chain.rpc_url",
        name = "chain.rpc_url",
        env = "ETH_RPC_URL",
        default_value = "http://localhost:8545"
    )]
    eth_rpc_url: String,

    /// Expected chain id; startup fails if the node disagrees
    #[arg(
        long = "chain.id",
        name = "chain.id",
        env = "CHAIN_ID",
        default_value = "31337"
    )]
    chain_id: u64,

    /// The sole supported EntryPoint contract address
    #[arg(
        long = "chain.entry_point",
        name = "chain.entry_point",
        env = "ENTRY_POINT_ADDRESS",
        default_value = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
    )]
    entry_point: String,
}

/// CLI options for the bundler loop
#[derive(Args, Debug)]
#[command(next_help_heading = "Bundler")]
struct BundlerArgs {
    /// Signing key for handleOps submissions
    #[arg(
        long = "bundler.private_key",
        name = "bundler.private_key",
        env = "BUNDLER_PRIVATE_KEY"
    )]
    private_key: String,

    /// Fee recipient passed to handleOps; defaults to the signer address
    #[arg(
        long = "bundler.beneficiary",
        name = "bundler.beneficiary",
        env = "BUNDLER_BENEFICIARY"
    )]
    beneficiary: Option<String>,

    /// Wei balance below which the signer health check degrades
    #[arg(
        long = "bundler.min_signer_balance",
        name = "bundler.min_signer_balance",
        env = "BUNDLER_MIN_SIGNER_BALANCE",
        default_value = "100000000000000000"
    )]
    min_signer_balance: String,

    /// Maximum operations packed into one bundle
    #[arg(
        long = "bundler.max_ops_per_bundle",
        name = "bundler.max_ops_per_bundle",
        env = "MAX_OPS_PER_BUNDLE",
        default_value = "10"
    )]
    max_ops_per_bundle: usize,

    /// Gas cap for a bundle transaction
    #[arg(
        long = "bundler.max_bundle_gas",
        name = "bundler.max_bundle_gas",
        env = "MAX_BUNDLE_GAS",
        default_value = "10000000"
    )]
    max_bundle_gas: u64,

    /// Tick period in milliseconds
    #[arg(
        long = "bundler.interval_ms",
        name = "bundler.interval_ms",
        env = "BUNDLE_INTERVAL_MS",
        default_value = "5000"
    )]
    bundle_interval_ms: u64,

    /// How long to wait for a bundle receipt before failing, in milliseconds
    #[arg(
        long = "bundler.tx_timeout_ms",
        name = "bundler.tx_timeout_ms",
        env = "TX_TIMEOUT_MS",
        default_value = "120000"
    )]
    tx_timeout_ms: u64,

    /// Bundle lock TTL in milliseconds
    #[arg(
        long = "bundler.lock_ttl_ms",
        name = "bundler.lock_ttl_ms",
        env = "LOCK_TTL_MS",
        default_value = "30000"
    )]
    lock_ttl_ms: u64,

    /// Admission fails once this many operations are pending
    #[arg(
        long = "bundler.max_mempool_size",
        name = "bundler.max_mempool_size",
        env = "MAX_MEMPOOL_SIZE",
        default_value = "1000"
    )]
    max_mempool_size: usize,

    /// Mempool cache TTL in milliseconds
    #[arg(
        long = "bundler.mempool_ttl_ms",
        name = "bundler.mempool_ttl_ms",
        env = "MEMPOOL_TTL_MS",
        default_value = "86400000"
    )]
    mempool_ttl_ms: u64,
}

/// CLI options for the run command
///
/// Combines the options for each component into a single struct
#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    rpc: RpcArgs,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    chain: ChainArgs,

    #[command(flatten)]
    bundler: BundlerArgs,
}

/// CLI commands
#[derive(Debug, Subcommand)]
enum Command {
    /// Run command
    ///
    /// Runs the mempool, bundler loop, and RPC server in a single process.
    #[command(name = "run")]
    Run(RunArgs),
}

/// CLI options for the metrics server
#[derive(Debug, Args)]
#[command(next_help_heading = "Metrics")]
struct Metrics {
    /// Port to listen on for metrics requests
    #[arg(
        long = "metrics.port",
        name = "metrics.port",
        env = "METRICS_PORT",
        default_value = "8080",
        global = true
    )]
    port: u16,

    /// Host to listen on for metrics requests
    #[arg(
        long = "metrics.host",
        name = "metrics.host",
        env = "METRICS_HOST",
        default_value = "0.0.0.0",
        global = true
    )]
    host: String,
}

/// CLI options for logging
#[derive(Debug, Args)]
#[command(next_help_heading = "Logging")]
struct Logs {
    /// Log level
    ///
    /// Valid values are: trace, debug, info, warn, error
    #[arg(
        long = "log.level",
        name = "log.level",
        env = "LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    level: String,

    /// Log file
    ///
    /// If not provided, logs will be written to stdout
    #[arg(
        long = "log.file",
        name = "log.file",
        env = "LOG_FILE",
        default_value = None,
        global = true
    )]
    file: Option<String>,
}

/// CLI options
#[derive(Debug, Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    metrics: Metrics,

    #[clap(flatten)]
    logs: Logs,
}
