use std::time::Instant;

use jsonrpsee::server::logger::{HttpRequest, Logger, MethodKind, TransportProtocol};
use jsonrpsee::types::Params;

/// jsonrpsee logger hook that feeds per-method request counters and latency
/// histograms into the metrics registry.
#[derive(Clone)]
pub struct RpcMetricsLogger;

impl Logger for RpcMetricsLogger {
    type Instant = Instant;

    fn on_connect(&self, _remote_addr: std::net::SocketAddr, _request: &HttpRequest, _t: TransportProtocol) {}

    fn on_request(&self, _transport: TransportProtocol) -> Self::Instant {
        Instant::now()
    }

    fn on_call(&self, method_name: &str, _params: Params<'_>, _kind: MethodKind, _transport: TransportProtocol) {
        metrics::increment_counter!("rpc_requests", "method" => method_name.to_string());
    }

    fn on_result(
        &self,
        method_name: &str,
        success: bool,
        started_at: Self::Instant,
        _transport: TransportProtocol,
    ) {
        metrics::histogram!(
            "rpc_request_latency_seconds",
            started_at.elapsed().as_secs_f64(),
            "method" => method_name.to_string()
        );
        if !success {
            metrics::increment_counter!("rpc_errors", "method" => method_name.to_string());
        }
    }

    fn on_response(&self, _result: &str, _started_at: Self::Instant, _transport: TransportProtocol) {}

    fn on_disconnect(&self, _remote_addr: std::net::SocketAddr, _transport: TransportProtocol) {}
}
