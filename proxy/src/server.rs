//! Proxy shell: WebSocket listeners.
//!
//! Two independent listeners, one route each:
//! - GET /doubao-proxy (port 3001): upgraded connections get a Doubao
//!   session bridge.
//! - GET /proxy (port 3000): upgraded connections get the GLM
//!   pass-through bridge.
//!
//! Every other path falls through to the router's 404. One bridge per
//! accepted connection; the bridge task ends with the connection.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::config::{DoubaoUpstream, GlmUpstream};
use crate::error::Result;
use crate::{bridge, glm};

/// Default listen port of the Doubao bridge.
pub const DOUBAO_PORT: u16 = 3001;

/// Default listen port of the GLM bridge.
pub const GLM_PORT: u16 = 3000;

/// Builds the Doubao bridge router.
pub fn doubao_router(upstream: DoubaoUpstream) -> Router {
    Router::new()
        .route("/doubao-proxy", get(doubao_ws))
        .with_state(upstream)
}

/// Builds the GLM bridge router.
pub fn glm_router(upstream: GlmUpstream) -> Router {
    Router::new().route("/proxy", get(glm_ws)).with_state(upstream)
}

/// Serves the Doubao bridge until the listener fails or the task is dropped.
pub async fn serve_doubao(addr: SocketAddr, upstream: DoubaoUpstream) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("doubao bridge listening on ws://{}/doubao-proxy", addr);
    axum::serve(listener, doubao_router(upstream)).await?;
    Ok(())
}

/// Serves the GLM bridge until the listener fails or the task is dropped.
pub async fn serve_glm(addr: SocketAddr, upstream: GlmUpstream) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("glm bridge listening on ws://{}/proxy", addr);
    axum::serve(listener, glm_router(upstream)).await?;
    Ok(())
}

async fn doubao_ws(
    ws: WebSocketUpgrade,
    State(upstream): State<DoubaoUpstream>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge::run(socket, upstream))
}

async fn glm_ws(ws: WebSocketUpgrade, State(upstream): State<GlmUpstream>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| glm::run(socket, upstream))
}
