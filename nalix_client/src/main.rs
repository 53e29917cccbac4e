//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p nalix_client -- [--addr 127.0.0.1:40010] [--message hello]
//!                                 [--opcode 1000] [--encrypt] [--time-sync]
//!
//! Connects to a server, optionally performs the handshake, sends one text
//! packet, and prints the reply. With `--time-sync` it also reports the
//! estimated clock offset and round-trip delay.

use std::env;

use anyhow::Context;
use nalix_client::client::{PacketClient, SendOptions};
use nalix_shared::config::ClientConfig;
use nalix_shared::control::Text256;
use nalix_shared::timesync::ClockSample;
use tracing::info;

struct Args {
    cfg: ClientConfig,
    message: String,
    opcode: u16,
    encrypt: bool,
    time_sync: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        cfg: ClientConfig::default(),
        message: "hello".to_string(),
        opcode: 1000,
        encrypt: false,
        time_sync: false,
    };
    let argv: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--addr" if i + 1 < argv.len() => {
                args.cfg.server_addr = argv[i + 1].clone();
                i += 2;
            }
            "--message" if i + 1 < argv.len() => {
                args.message = argv[i + 1].clone();
                i += 2;
            }
            "--opcode" if i + 1 < argv.len() => {
                args.opcode = argv[i + 1].parse().unwrap_or(args.opcode);
                i += 2;
            }
            "--encrypt" => {
                args.encrypt = true;
                i += 1;
            }
            "--time-sync" => {
                args.time_sync = true;
                i += 1;
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
    let mut client = PacketClient::connect(args.cfg.clone())
        .await
        .context("connect")?;

    if args.encrypt {
        client.handshake().await.context("handshake")?;
        info!("handshake complete, session encrypted");
    }

    let request = Text256::new(args.opcode, args.message.clone()).context("build packet")?;
    let opts = if args.encrypt {
        SendOptions::encrypted()
    } else {
        SendOptions::default()
    };
    let reply: Text256 = client.request(&request, opts).await.context("request")?;
    println!("reply (opcode {}): {}", reply.opcode, reply.content);

    if args.time_sync {
        let ClockSample {
            offset_ms,
            round_trip_ms,
        } = client.time_sync().await.context("time sync")?;
        println!("clock offset: {offset_ms} ms, round trip: {round_trip_ms} ms");
    }

    client.disconnect().await.context("disconnect")?;
    Ok(())
}
