//! Metrics collection and exposition.
//!
//! # Metrics
//! - `server_connections_accepted_total` (counter): by listener
//! - `server_tls_handshake_failures_total` (counter): by listener
//! - `server_alpn_dispatch_total` (counter): by negotiated protocol
//! - `server_requests_total` (counter): by listener and protocol
//! - `server_tunnels_opened_total` (counter): upgrades and CONNECTs accepted
//! - `tls_session_cache_lookups_total` (counter): hit or miss
//! - `tls_session_cache_entries` (gauge): current cache size

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) -> bool {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            tracing::info!(address = %addr, "Metrics exporter listening");
            true
        }
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter");
            false
        }
    }
}

pub fn record_connection_accepted(listener_id: &str) {
    ::metrics::counter!("server_connections_accepted_total", "listener" => listener_id.to_string())
        .increment(1);
}

pub fn record_handshake_failure(listener_id: &str) {
    ::metrics::counter!("server_tls_handshake_failures_total", "listener" => listener_id.to_string())
        .increment(1);
}

pub fn record_alpn_dispatch(protocol: &'static str) {
    ::metrics::counter!("server_alpn_dispatch_total", "protocol" => protocol).increment(1);
}

pub fn record_request(listener_id: &str, protocol: &'static str) {
    ::metrics::counter!(
        "server_requests_total",
        "listener" => listener_id.to_string(),
        "protocol" => protocol
    )
    .increment(1);
}

pub fn record_tunnel_opened(listener_id: &str) {
    ::metrics::counter!("server_tunnels_opened_total", "listener" => listener_id.to_string())
        .increment(1);
}

pub fn record_session_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    ::metrics::counter!("tls_session_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_session_cache_size(size: usize) {
    ::metrics::gauge!("tls_session_cache_entries").set(size as f64);
}
