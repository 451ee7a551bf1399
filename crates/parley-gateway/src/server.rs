//! Axum-based WebSocket server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Routes: `/ws` for workers, `/health` for status.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until CTRL+C.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.gateway_bind(), state.config.gateway_port());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let connections = state.summaries().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "connections": connections.len(),
        "pipelines": connections,
    }))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for CTRL+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
