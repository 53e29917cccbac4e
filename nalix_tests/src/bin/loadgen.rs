//! Echo load generator.
//!
//! Spawns an in-process server plus a set of concurrent clients hammering
//! the echo route, then reports throughput. Point it at an external server
//! with `--addr` to skip the in-process one.
//!
//! Usage:
//!   cargo run -p nalix_tests --bin loadgen -- [--addr host:port]
//!       [--connections 8] [--requests 1000]

use std::env;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use nalix_client::client::{PacketClient, SendOptions};
use nalix_server::registry::{DispatchRegistry, HandlerAttrs, PacketContext};
use nalix_server::server::PacketServer;
use nalix_shared::catalog::Catalog;
use nalix_shared::config::{ClientConfig, ServerConfig};
use nalix_shared::control::Text256;
use tracing::info;

struct Args {
    addr: Option<String>,
    connections: usize,
    requests: usize,
}

fn parse_args() -> Args {
    let mut args = Args {
        addr: None,
        connections: 8,
        requests: 1_000,
    };
    let argv: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--addr" if i + 1 < argv.len() => {
                args.addr = Some(argv[i + 1].clone());
                i += 2;
            }
            "--connections" if i + 1 < argv.len() => {
                args.connections = argv[i + 1].parse().unwrap_or(args.connections);
                i += 2;
            }
            "--requests" if i + 1 < argv.len() => {
                args.requests = argv[i + 1].parse().unwrap_or(args.requests);
                i += 2;
            }
            _ => i += 1,
        }
    }
    args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();

    let addr = match &args.addr {
        Some(addr) => addr.clone(),
        None => {
            let cfg = ServerConfig {
                // The generator is a single IP hammering the server.
                max_connections_per_ip: args.connections as u32 + 1,
                max_allowed_requests: usize::MAX / 2,
                ..ServerConfig::default()
            };
            let routes = DispatchRegistry::builder().route(
                1000,
                HandlerAttrs::default(),
                |ctx: PacketContext| async move {
                    let incoming: Text256 = ctx.decode()?;
                    Text256::new(incoming.opcode, incoming.content)
                },
            )?;
            let server =
                PacketServer::bind_ephemeral(cfg, routes, Catalog::with_framework_packets())
                    .await
                    .context("bind server")?;
            let addr = server.local_addr()?.to_string();
            tokio::spawn(Arc::clone(&server).run());
            info!(%addr, "in-process server started");
            addr
        }
    };

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(args.connections);
    for worker in 0..args.connections {
        let per_client = args.requests / args.connections.max(1);
        let cfg = ClientConfig {
            server_addr: addr.clone(),
            ..ClientConfig::default()
        };
        tasks.push(tokio::spawn(async move {
            let mut client = PacketClient::connect(cfg).await?;
            let payload = format!("load-{worker}");
            for _ in 0..per_client {
                let request = Text256::new(1000, payload.clone())?;
                let reply: Text256 = client.request(&request, SendOptions::default()).await?;
                anyhow::ensure!(reply.content == payload, "echo mismatch");
            }
            client.disconnect().await?;
            Ok::<_, anyhow::Error>(per_client)
        }));
    }

    let mut completed = 0usize;
    for task in tasks {
        completed += task.await??;
    }

    let elapsed = started.elapsed();
    let rps = completed as f64 / elapsed.as_secs_f64();
    println!(
        "{completed} echo round-trips over {} connections in {:.2?} ({rps:.0} req/s)",
        args.connections, elapsed
    );
    Ok(())
}
