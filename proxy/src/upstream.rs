//! Upstream WebSocket handshakes.
//!
//! Browsers cannot attach custom headers to a WebSocket upgrade, which is
//! the reason this proxy exists: the credential headers are attached here,
//! server-side, when dialing the upstream endpoints.

use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderValue;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::{DoubaoUpstream, GlmUpstream, APP_KEY_DIALOGUE, RESOURCE_DIALOGUE};
use crate::error::{Error, Result};

/// An established upstream connection.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials the Doubao realtime dialogue endpoint with the credential headers.
pub async fn dial_doubao(upstream: &DoubaoUpstream) -> Result<UpstreamStream> {
    let mut request = upstream
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Config(format!("upstream url: {}", e)))?;

    let connect_id = generate_connect_id();
    debug!(connect_id = %connect_id, "dialing doubao upstream");

    let headers = request.headers_mut();
    headers.insert("X-Api-App-ID", header_value("X-Api-App-ID", &upstream.app_id)?);
    headers.insert(
        "X-Api-Access-Key",
        header_value("X-Api-Access-Key", &upstream.access_key)?,
    );
    headers.insert(
        "X-Api-Resource-Id",
        header_value("X-Api-Resource-Id", RESOURCE_DIALOGUE)?,
    );
    headers.insert("X-Api-App-Key", header_value("X-Api-App-Key", APP_KEY_DIALOGUE)?);
    headers.insert(
        "X-Api-Connect-Id",
        header_value("X-Api-Connect-Id", &connect_id)?,
    );

    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

/// Dials the GLM realtime endpoint with the bearer credential.
pub async fn dial_glm(upstream: &GlmUpstream) -> Result<UpstreamStream> {
    let mut request = upstream
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Config(format!("upstream url: {}", e)))?;

    request
        .headers_mut()
        .insert("Authorization", header_value("Authorization", &upstream.api_key)?);

    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid header value for {}", name)))
}

/// Generates a connect id of the form `client_<epoch_ms>_<random9>`.
fn generate_connect_id() -> String {
    format!("client_{}_{}", epoch_millis(), random_suffix(9))
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn random_suffix(len: usize) -> String {
    let chars: Vec<char> = "abcdefghijklmnopqrstuvwxyz0123456789".chars().collect();
    let mut result = String::with_capacity(len);
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed);

    for _ in 0..len {
        result.push(chars[(seed % chars.len() as u64) as usize]);
        seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
    }
    result
}
