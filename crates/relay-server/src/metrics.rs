//! Metrics export.
//!
//! The core crates instrument through the `metrics` facade; this
//! module describes the metric set and exports it in Prometheus
//! format.

use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::metrics::names;
use std::net::SocketAddr;
use tracing::info;

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_gauge!(names::USER_HUBS_ACTIVE, "Current number of live user hubs");
    metrics::describe_counter!(names::USER_HUBS_TOTAL, "User hubs created since start");
    metrics::describe_counter!(
        names::HUB_EVICTIONS_TOTAL,
        "User hubs cancelled for inactivity"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of connected clients"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Envelopes processed, labeled by direction"
    );
    metrics::describe_counter!(names::PLUGIN_SPAWNS_TOTAL, "Plugin processes spawned");
    metrics::describe_counter!(names::PLUGIN_RESTARTS_TOTAL, "Plugin crash restarts");
    metrics::describe_counter!(
        names::PLUGIN_FAILURES_TOTAL,
        "Plugins that entered the terminal failed state"
    );
    metrics::describe_counter!(
        names::CLIENT_ERRORS_TOTAL,
        "Error replies sent to clients, labeled by code"
    );
    metrics::describe_counter!(
        names::DROPPED_ENVELOPES_TOTAL,
        "Envelopes dropped on full inboxes"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
