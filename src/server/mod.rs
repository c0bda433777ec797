//! HTTP server wiring
//!
//! Mounts the messages orchestrator and the JSON API onto an axum router
//! and serves it with graceful shutdown.

pub mod api;
pub mod error;
pub mod messages;
mod passthrough;
pub mod state;

pub use error::ProxyError;
pub use state::AppState;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::messages_handler))
        .route(
            "/v1/messages/count_tokens",
            post(api::count_tokens_handler),
        )
        .route("/health", get(api::health_handler))
        .route("/api/config/get", get(api::config_get_handler))
        .route("/api/config/update", post(api::config_update_handler))
        .route("/api/history", get(api::history_handler))
        .route("/api/summary", get(api::summary_handler))
        .with_state(state)
}

/// Bind and serve until the shutdown signal fires
pub async fn serve(
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr;
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("Proxy listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}
