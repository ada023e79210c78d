//! Metrics export for the Parley server.
//!
//! The library crates record through the `metrics` facade; this module
//! describes those metrics and installs the Prometheus exporter.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::metrics::names;
use std::net::SocketAddr;
use tracing::info;

pub use parley_core::metrics::ConnectionMetricsGuard;

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::HANDSHAKES_REJECTED,
        "Connection attempts refused during the handshake"
    );
    metrics::describe_gauge!(names::SESSIONS_LIVE, "Sessions registered with the hub");
    metrics::describe_counter!(names::SESSIONS_CLOSED, "Sessions ended, by close reason");
    metrics::describe_counter!(names::ENVELOPES_IN, "Envelopes read from clients");
    metrics::describe_counter!(names::ENVELOPES_OUT, "Envelopes written to clients");
    metrics::describe_counter!(
        names::ENVELOPES_REJECTED,
        "Client envelopes answered with an error"
    );
    metrics::describe_counter!(names::DELIVERIES, "Routed envelopes, by delivery path");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Deliveries dropped because a session inbox was full"
    );
    metrics::describe_counter!(
        names::BUS_DECODE_ERRORS,
        "Bus payloads that could not be decoded"
    );
    metrics::describe_counter!(
        names::PRESENCE_FANOUTS,
        "Presence notices sent to contacts"
    );
    metrics::describe_counter!(names::HEARTBEATS, "Heartbeat answers received");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
