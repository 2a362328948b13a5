//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p classic_client -- [--addr 127.0.0.1:25565] [--name Steve] [--key <key>] [--cpe]
//!
//! The client logs in, downloads the level and prints chat.
//!
//! Console commands:
//!   say <message>  - Send chat message
//!   status         - Show client status
//!   quit           - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;

use anyhow::Context;
use classic_client::client::{GameClient, LoginOptions};
use classic_shared::net::ServerPacket;
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    addr: String,
    login: LoginOptions,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        addr: "127.0.0.1:25565".to_string(),
        login: LoginOptions::new("Player", "-"),
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                parsed.addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                parsed.login.name = args[i + 1].clone();
                i += 2;
            }
            "--key" if i + 1 < args.len() => {
                parsed.login.verification_key = args[i + 1].clone();
                i += 2;
            }
            "--cpe" => {
                parsed.login.negotiate = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let addr: SocketAddr = args.addr.parse().context("parse --addr")?;
    let mut client = GameClient::connect_with(addr, &args.login)
        .await
        .context("connect")?;
    if let Some(level) = &client.level {
        info!(
            width = level.width,
            height = level.height,
            depth = level.depth,
            chunks = level.chunk_percents.len(),
            "Spawned"
        );
    }

    // Spawn stdin reader thread.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Connected to {}. Type 'say <message>', 'status' or 'quit'.", client.server_name);

    // Packet reads are not cancel-safe, so console lines are handled between
    // packets. The server's keep-alive pings bound the latency.
    loop {
        match client.recv().await? {
            ServerPacket::Message { message, .. } => println!("{message}"),
            ServerPacket::Kick { reason } => {
                println!("Kicked: {reason}");
                break;
            }
            _ => {}
        }
        while let Ok(line) = console_rx.try_recv() {
            match line.as_str() {
                "quit" => return Ok(()),
                "status" => println!(
                    "server: {}  motd: {}  operator: {}  position: {:?}",
                    client.server_name, client.server_motd, client.operator, client.position
                ),
                cmd => match cmd.strip_prefix("say ") {
                    Some(message) => client.say(message).await?,
                    None => println!("Unknown command: {cmd}"),
                },
            }
        }
    }

    Ok(())
}
