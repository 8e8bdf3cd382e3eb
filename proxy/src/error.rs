//! Error types for the voice proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (missing credentials, bad URL).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Upstream WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Client-side WebSocket error.
    #[error("client socket error: {0}")]
    ClientSocket(#[from] axum::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}
