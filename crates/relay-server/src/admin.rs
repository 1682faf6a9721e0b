//! Admin HTTP surface.
//!
//! A small read-only endpoint for deployment checks: `GET /health`
//! reports the server version and the Central Hub's latest stats
//! snapshot.

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use relay_core::CentralStats;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
struct AdminState {
    stats: watch::Receiver<CentralStats>,
}

/// Serve the admin endpoint until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_admin_server(port: u16, stats: watch::Receiver<CentralStats>) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(AdminState { stats });

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Admin endpoint listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let hubs = state.stats.borrow().clone();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "hubs": hubs,
    }))
}
