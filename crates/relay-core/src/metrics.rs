//! Metric instrumentation helpers.
//!
//! Uses the `metrics` facade; the server crate describes the set and
//! installs the Prometheus exporter.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const USER_HUBS_ACTIVE: &str = "relay_user_hubs_active";
    pub const USER_HUBS_TOTAL: &str = "relay_user_hubs_total";
    pub const HUB_EVICTIONS_TOTAL: &str = "relay_hub_evictions_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const PLUGIN_SPAWNS_TOTAL: &str = "relay_plugin_spawns_total";
    pub const PLUGIN_RESTARTS_TOTAL: &str = "relay_plugin_restarts_total";
    pub const PLUGIN_FAILURES_TOTAL: &str = "relay_plugin_failures_total";
    pub const CLIENT_ERRORS_TOTAL: &str = "relay_client_errors_total";
    pub const DROPPED_ENVELOPES_TOTAL: &str = "relay_dropped_envelopes_total";
}

/// Record a User Hub creation.
pub fn record_hub_created() {
    counter!(names::USER_HUBS_TOTAL).increment(1);
    gauge!(names::USER_HUBS_ACTIVE).increment(1.0);
}

/// Record a User Hub removal.
pub fn record_hub_removed() {
    gauge!(names::USER_HUBS_ACTIVE).decrement(1.0);
}

/// Record an inactivity eviction.
pub fn record_eviction() {
    counter!(names::HUB_EVICTIONS_TOTAL).increment(1);
}

/// Record a client attaching to a User Hub.
pub fn record_client_joined() {
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a client detaching.
pub fn record_client_left() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed envelope.
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Record a plugin spawn attempt that succeeded.
pub fn record_plugin_spawn() {
    counter!(names::PLUGIN_SPAWNS_TOTAL).increment(1);
}

/// Record a plugin crash restart.
pub fn record_plugin_restart() {
    counter!(names::PLUGIN_RESTARTS_TOTAL).increment(1);
}

/// Record a plugin entering its terminal failed state.
pub fn record_plugin_failure() {
    counter!(names::PLUGIN_FAILURES_TOTAL).increment(1);
}

/// Record an error reply sent to a client.
pub fn record_client_error(code: &'static str) {
    counter!(names::CLIENT_ERRORS_TOTAL, "code" => code).increment(1);
}

/// Record an envelope dropped on a full inbox.
pub fn record_dropped_envelope() {
    counter!(names::DROPPED_ENVELOPES_TOTAL).increment(1);
}
