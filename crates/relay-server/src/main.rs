//! # Relay Server
//!
//! Supervised two-tier message relay between WebSocket transports and
//! per-user plugin processes.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file (relay.toml) or environment variables
//! RELAY_HOST=node-1 RELAY_USER_SECURITY_SCOPE=user.default relay
//! ```
//!
//! The transport layer is an external process: it announces
//! connections to the Central Hub (registered as `wippy.central`),
//! obeys `ws.control` rebinds, and then talks to User Hubs directly.

mod admin;
mod config;
mod discovery;
mod host;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::plugin::PluginTable;
use relay_core::process::{self, SystemEvent};
use relay_core::registry::ProcessRegistry;
use relay_core::security::StaticScopes;
use relay_core::CentralHub;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load and validate configuration; missing required fields are
    // fatal here, before anything is spawned.
    let config = config::Config::load()?;
    config.validate()?;

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(error) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", error);
        }
    }

    // Discover the plugin set once.
    let plugins = match &config.registry.path {
        Some(path) => {
            let registry = discovery::FileRegistry::new(path);
            discovery::discover_plugins(&registry, &config.host)?
        }
        None => {
            tracing::warn!("no registry snapshot configured, starting with an empty plugin set");
            Vec::new()
        }
    };
    tracing::info!(plugins = plugins.len(), "plugin discovery complete");

    let table = Arc::new(PluginTable::new(plugins));
    let security = Arc::new(StaticScopes::with_scopes([config.user_security_scope.clone()]));
    let plugin_host = Arc::new(host::StdioPluginHost::new(&config.plugins.bin_dir));
    let names = Arc::new(ProcessRegistry::new());

    let hub_config = config.hub_config();
    let cancel_timeout = hub_config.cancel_timeout;
    let (central, stats) = CentralHub::new(hub_config, table, security, plugin_host, names)
        .context("central hub startup failed")?;

    let (root, mut root_events) = process::system_channel();
    let central_hub = central.spawn(&root);
    tracing::info!(hub = %central_hub.pid(), "relay started");

    if config.admin.enabled {
        let stats = stats.clone();
        let port = config.admin.port;
        tokio::spawn(async move {
            if let Err(error) = admin::run_admin_server(port, stats).await {
                tracing::error!("Admin server failed: {}", error);
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            central_hub.cancel(cancel_timeout);
            while let Some(event) = root_events.recv().await {
                if let SystemEvent::Exit { pid, reason } = event {
                    if pid.id() == central_hub.pid().id() {
                        tracing::info!(reason = %reason, "central hub stopped");
                        break;
                    }
                }
            }
        }
        Some(SystemEvent::Exit { reason, .. }) = root_events.recv() => {
            tracing::error!(reason = %reason, "central hub exited unexpectedly");
        }
    }

    Ok(())
}
