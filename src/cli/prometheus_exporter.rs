use std::net::SocketAddr;

use metrics::Unit;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::layers::{PrefixLayer, Stack};

/// Serves the Prometheus text exposition on its own listener and registers
/// metadata for every metric this service emits.
pub fn initialize(listen_addr: SocketAddr) -> anyhow::Result<()> {
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .build()?;
    tokio::spawn(exporter);
    Stack::new(recorder)
        .push(PrefixLayer::new("userop_bundler"))
        .install()?;
    describe_metrics();

    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "mempool_ops_admitted",
        Unit::Count,
        "User operations admitted to the mempool"
    );
    metrics::describe_counter!(
        "mempool_ops_replaced",
        Unit::Count,
        "Incumbent user operations evicted by a fee-bump replacement"
    );
    metrics::describe_counter!(
        "mempool_ops_rejected",
        Unit::Count,
        "User operations rejected at admission, labeled by reason"
    );
    metrics::describe_gauge!(
        "mempool_size",
        Unit::Count,
        "Pending user operations currently indexed in the cache"
    );
    metrics::describe_counter!(
        "bundler_bundles_submitted",
        Unit::Count,
        "Bundle transactions submitted to the EntryPoint"
    );
    metrics::describe_counter!(
        "bundler_bundles_confirmed",
        Unit::Count,
        "Bundle transactions confirmed on chain"
    );
    metrics::describe_counter!(
        "bundler_bundles_failed",
        Unit::Count,
        "Bundles that failed before or after submission"
    );
    metrics::describe_counter!(
        "bundler_ops_confirmed",
        Unit::Count,
        "User operations confirmed as part of a bundle"
    );
    metrics::describe_counter!(
        "rpc_requests",
        Unit::Count,
        "JSON-RPC calls received, labeled by method"
    );
    metrics::describe_counter!(
        "rpc_errors",
        Unit::Count,
        "JSON-RPC calls that returned an error, labeled by method"
    );
    metrics::describe_histogram!(
        "rpc_request_latency_seconds",
        Unit::Seconds,
        "JSON-RPC request latency, labeled by method"
    );
}
