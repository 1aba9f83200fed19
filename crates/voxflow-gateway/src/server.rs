//! Axum server — WebSocket endpoint, health, and the connection cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tracing::{info, warn};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Start the gateway server. Blocks until shutdown.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let path = state.config.server.path.clone();
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);

    state
        .registry
        .spawn_idle_sweeper(Duration::from_secs(state.config.session.session_timeout_secs));

    let app = Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    // Refuse before upgrading when at the connection cap.
    let active = state.active_connections.load(Ordering::SeqCst);
    if active >= state.config.transport.max_connections {
        let err = voxflow_core::error::GatewayError::ConnectionLimitExceeded;
        warn!(active, "Refusing connection: {err}");
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::to_value(err.to_payload()).unwrap_or_default()),
        )
            .into_response();
    }

    let session_id = params.get("session_id").cloned();
    let max_message = state.config.transport.read_buffer_size;
    let write_buffer = state.config.transport.write_buffer_size;

    // Writes flush per message; the max bound applies backpressure if the
    // peer stops reading.
    ws.max_message_size(max_message)
        .write_buffer_size(0)
        .max_write_buffer_size(write_buffer.max(64 * 1024))
        .on_upgrade(move |socket| async move {
            state.active_connections.fetch_add(1, Ordering::SeqCst);
            handle_ws_connection(state.clone(), socket, session_id).await;
            state.active_connections.fetch_sub(1, Ordering::SeqCst);
        })
        .into_response()
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let active_sessions = state.registry.count().await;
    axum::Json(json!({
        "status": "ok",
        "active_sessions": active_sessions,
    }))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
