//! WebSocket proxy bridging browser voice clients to realtime dialogue
//! upstreams.
//!
//! Browsers cannot attach custom authentication headers to a WebSocket
//! upgrade. This crate runs server-side, attaches the credentials to the
//! upstream handshake, and shuttles audio and control messages both ways.
//!
//! Two bridges share one shell:
//!
//! | Bridge | Route | Upstream | Translation |
//! |--------|-------|----------|-------------|
//! | Doubao | `/doubao-proxy` | `wss://openspeech.bytedance.com/api/v3/realtime/dialogue` | binary event protocol ⇄ JSON + raw PCM |
//! | GLM | `/proxy` | `wss://open.bigmodel.cn/api/paas/v4/realtime` | none (verbatim) |
//!
//! The Doubao bridge drives the upstream's staged lifecycle
//! (StartConnection → StartSession → TaskRequest* → FinishSession /
//! FinishConnection), parks early client traffic in a pre-ready buffer and
//! replays it when the corresponding gate opens, and demultiplexes upstream
//! responses (session events, ASR transcripts, chat text, TTS audio) onto a
//! hybrid JSON + binary client stream.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use voicegate_proxy::config::DoubaoUpstream;
//! use voicegate_proxy::server;
//!
//! #[tokio::main]
//! async fn main() -> voicegate_proxy::Result<()> {
//!     let upstream = DoubaoUpstream::from_env()?;
//!     let addr = ([0, 0, 0, 0], server::DOUBAO_PORT).into();
//!     server::serve_doubao(addr, upstream).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod glm;
pub mod protocol;
pub mod server;
pub mod session;
pub mod upstream;

pub use config::{DoubaoUpstream, GlmUpstream, SessionConfig};
pub use error::{Error, Result};
pub use protocol::{events, Frame, MessageType, OutboundFrame, Payload};
pub use session::{Session, SessionState};
