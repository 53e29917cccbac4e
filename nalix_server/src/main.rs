//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p nalix_server -- [--addr 127.0.0.1] [--port 40010] [--workers 4]
//!
//! Serves a small demo route set on top of the framework handlers:
//!   opcode 1000: echoes text packets back to the sender
//!   opcode 1001: reports connection info as text
//!
//! Clients may handshake on the reserved opcode first and then exchange
//! encrypted traffic; plain packets work without it.

use std::env;

use anyhow::Context;
use nalix_server::registry::{DispatchRegistry, HandlerAttrs, PacketContext};
use nalix_server::server::PacketServer;
use nalix_shared::catalog::Catalog;
use nalix_shared::config::ServerConfig;
use nalix_shared::control::Text256;
use nalix_shared::error::ProtocolError;
use tracing::info;

fn parse_args() -> ServerConfig {
    let mut cfg = ServerConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.bind_ip = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().unwrap_or(cfg.port);
                i += 2;
            }
            "--workers" if i + 1 < args.len() => {
                cfg.dispatch_workers = args[i + 1].parse().unwrap_or(cfg.dispatch_workers);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

fn demo_routes() -> Result<nalix_server::registry::RegistryBuilder, ProtocolError> {
    DispatchRegistry::builder()
        .route(1000, HandlerAttrs::default(), |ctx: PacketContext| async move {
            let incoming: Text256 = ctx.decode()?;
            Text256::new(incoming.opcode, incoming.content)
        })?
        .route(1001, HandlerAttrs::default(), |ctx: PacketContext| async move {
            format!(
                "connection {} from {} since {}",
                ctx.connection.id(),
                ctx.connection.peer(),
                ctx.connection.connected_at().to_rfc3339(),
            )
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = parse_args();
    if cfg.enable_logging {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }
    info!(addr = %cfg.bind_addr(), workers = cfg.dispatch_workers, "starting server");

    let server = PacketServer::bind(cfg, demo_routes()?, Catalog::with_framework_packets())
        .await
        .context("bind server")?;
    info!(local = %server.local_addr()?, "server ready");

    server.run().await.context("server run")?;
    Ok(())
}
