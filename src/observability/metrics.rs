//! Metrics collection and exposition.
//!
//! # Metrics
//! - `polyserve_connections_active` (gauge): open connections by protocol
//! - `polyserve_connections_total` (counter): accepted connections by protocol
//! - `polyserve_handler_aborts_total` (counter): requests failed fast, by reason
//! - `polyserve_h2c_upgrades_total` (counter): prior-knowledge upgrades served
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; without an installed recorder
//!   every call is a no-op
//! - The Prometheus exporter is opt-in from the binary

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::Protocol;

pub const CONNECTIONS_ACTIVE: &str = "polyserve_connections_active";
pub const CONNECTIONS_TOTAL: &str = "polyserve_connections_total";
pub const HANDLER_ABORTS_TOTAL: &str = "polyserve_handler_aborts_total";
pub const H2C_UPGRADES_TOTAL: &str = "polyserve_h2c_upgrades_total";

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn connection_opened(protocol: Protocol) {
    ::metrics::counter!(CONNECTIONS_TOTAL, "protocol" => protocol.as_str()).increment(1);
    ::metrics::gauge!(CONNECTIONS_ACTIVE, "protocol" => protocol.as_str()).increment(1.0);
}

pub fn connection_closed(protocol: Protocol) {
    ::metrics::gauge!(CONNECTIONS_ACTIVE, "protocol" => protocol.as_str()).decrement(1.0);
}

/// `reason` is one of `stopped`, `failed` or `protocol`.
pub fn handler_aborted(reason: &'static str) {
    ::metrics::counter!(HANDLER_ABORTS_TOTAL, "reason" => reason).increment(1);
}

pub fn h2c_upgraded() {
    ::metrics::counter!(H2C_UPGRADES_TOTAL).increment(1);
}
