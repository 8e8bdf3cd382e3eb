//! GLM pass-through bridge.
//!
//! The degenerate mode of the proxy shell: every client frame is forwarded
//! verbatim to the upstream and every upstream frame verbatim to the
//! client. The only intelligence is the credential header on the upstream
//! handshake and a pre-ready buffer for frames that arrive while the
//! upstream is still connecting.

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};

use crate::config::GlmUpstream;
use crate::session::{PreReadyBuffer, MAX_DEFERRED_ITEMS};
use crate::upstream;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ABNORMAL: u16 = 1006;

/// Runs one pass-through connection to completion.
pub async fn run(client: WebSocket, upstream_config: GlmUpstream) {
    let conn_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let conn = conn_id.as_str();
    info!(conn, "glm client connected");

    let (mut client_tx, mut client_rx) = client.split();

    // Dial while buffering whatever the client already sends.
    let mut pending: PreReadyBuffer<UpstreamMessage> = PreReadyBuffer::new(MAX_DEFERRED_ITEMS);
    let dial = upstream::dial_glm(&upstream_config);
    tokio::pin!(dial);

    let upstream_stream = loop {
        tokio::select! {
            result = &mut dial => match result {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(conn, error = %e, "glm upstream handshake failed");
                    let _ = client_tx
                        .send(ClientMessage::Text(
                            json!({"type": "error", "error": format!("服务器连接错误: {}", e)})
                                .to_string()
                                .into(),
                        ))
                        .await;
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    return;
                }
            },
            msg = client_rx.next() => match msg {
                Some(Ok(msg)) => {
                    if let Some(forward) = client_to_upstream(msg) {
                        if !pending.push(forward) {
                            warn!(conn, "pre-ready buffer full, client frame dropped");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(conn, error = %e, "client socket error during handshake");
                    return;
                }
                None => {
                    info!(conn, "client left before glm upstream connected");
                    return;
                }
            },
        }
    };

    let (mut up_tx, mut up_rx) = upstream_stream.split();

    // Flush everything that queued up during the handshake, in order.
    for msg in pending.drain() {
        if let Err(e) = up_tx.send(msg).await {
            warn!(conn, error = %e, "flush to glm upstream failed");
            let _ = client_tx.send(ClientMessage::Close(None)).await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(ClientMessage::Close(_))) | None => {
                    info!(conn, "glm client disconnected");
                    let _ = up_tx.close().await;
                    break;
                }
                Some(Ok(msg)) => {
                    if let Some(forward) = client_to_upstream(msg) {
                        if let Err(e) = up_tx.send(forward).await {
                            warn!(conn, error = %e, "forward to glm upstream failed");
                            let _ = client_tx
                                .send(ClientMessage::Close(Some(CloseFrame {
                                    code: CLOSE_NORMAL,
                                    reason: "Server connection closed".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(conn, error = %e, "glm client socket error");
                    let _ = up_tx.close().await;
                    break;
                }
            },

            msg = up_rx.next() => match msg {
                Some(Ok(UpstreamMessage::Close(close))) => {
                    let code = match &close {
                        Some(cf) => u16::from(cf.code),
                        None => CLOSE_NORMAL,
                    };
                    info!(conn, code, "glm upstream closed");
                    let close_code = if code == CLOSE_ABNORMAL { CLOSE_NORMAL } else { code };
                    let _ = client_tx
                        .send(ClientMessage::Close(Some(CloseFrame {
                            code: close_code,
                            reason: "Server connection closed".into(),
                        })))
                        .await;
                    break;
                }
                Some(Ok(msg)) => {
                    if let Some(forward) = upstream_to_client(msg) {
                        if let Err(e) = client_tx.send(forward).await {
                            debug!(conn, error = %e, "forward to glm client failed");
                            let _ = up_tx.close().await;
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(conn, error = %e, "glm upstream error");
                    let _ = client_tx
                        .send(ClientMessage::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "Server connection closed".into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    info!(conn, "glm upstream gone");
                    let _ = client_tx
                        .send(ClientMessage::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "Server connection closed".into(),
                        })))
                        .await;
                    break;
                }
            },
        }
    }

    info!(conn, "glm session closed");
}

/// Converts a client data frame for the upstream. Control frames are
/// handled by the socket layers and not forwarded.
fn client_to_upstream(msg: ClientMessage) -> Option<UpstreamMessage> {
    match msg {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text.as_str().into())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        _ => None,
    }
}

/// Converts an upstream data frame for the client.
fn upstream_to_client(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.as_str().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        _ => None,
    }
}
