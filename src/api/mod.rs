//! Metrics exposition server
//!
//! Serves two endpoints on the configured metrics port:
//!
//! - `GET /metrics` — the registry in Prometheus text format
//! - `GET /health` — composite health JSON, 200 or 503
//!
//! Unknown paths fall through to axum's 404. The server runs on its own
//! task and only reads shared state; an in-flight scrape is served fully
//! before a graceful shutdown completes.

pub mod routes;
pub mod state;

pub use routes::{compute_health, HealthResponse, ProbeCounts, ResourceReport};
pub use state::ApiState;

use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Bind the metrics port and spawn the server.
///
/// Binding failure is fatal to the caller; it is the only error this
/// function returns.
pub async fn spawn_api_server(
    port: u16,
    state: ApiState,
    cancel: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let app = Router::new()
        .route("/metrics", get(routes::metrics))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind metrics port {port}"))?;
    let addr = listener.local_addr()?;

    info!("metrics server listening on {addr}");

    let join = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!("metrics server error: {err}");
        }
    });

    Ok((addr, join))
}
