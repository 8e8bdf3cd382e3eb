//! voicegate - WebSocket proxy server for realtime voice dialogue.
//!
//! Bridges browser clients to the Doubao realtime dialogue service (port
//! 3001, route /doubao-proxy) and to the GLM realtime service (port 3000,
//! route /proxy). Credentials come from the environment:
//!
//! - Doubao: DOUBAO_APP_ID, DOUBAO_ACCESS_KEY, DOUBAO_SECRET_KEY
//! - GLM:    API_KEY
//!
//! Startup fails when the credentials of an enabled bridge are missing.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicegate_proxy::config::{DoubaoUpstream, GlmUpstream};
use voicegate_proxy::server;

/// Realtime voice WebSocket proxy server.
#[derive(Parser, Debug)]
#[command(name = "voicegate")]
#[command(about = "WebSocket proxy for realtime voice dialogue upstreams")]
#[command(version)]
struct Args {
    /// Listen port of the Doubao bridge
    #[arg(long, default_value_t = server::DOUBAO_PORT)]
    doubao_port: u16,

    /// Listen port of the GLM bridge
    #[arg(long, default_value_t = server::GLM_PORT)]
    glm_port: u16,

    /// Which bridges to run: doubao, glm or both
    #[arg(long, default_value = "both")]
    mode: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let (run_doubao, run_glm) = match args.mode.as_str() {
        "both" => (true, true),
        "doubao" => (true, false),
        "glm" => (false, true),
        other => anyhow::bail!("unknown mode: {} (expected doubao, glm or both)", other),
    };

    let mut servers = tokio::task::JoinSet::new();

    if run_doubao {
        let upstream = DoubaoUpstream::from_env()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], args.doubao_port));
        servers.spawn(server::serve_doubao(addr, upstream));
    }
    if run_glm {
        let upstream = GlmUpstream::from_env()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], args.glm_port));
        servers.spawn(server::serve_glm(addr, upstream));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
        }
        Some(result) = servers.join_next() => {
            result??;
        }
    }

    servers.abort_all();
    Ok(())
}
