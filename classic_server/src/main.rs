//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p classic_server -- [--config server.json] [--addr 0.0.0.0:25565]
//!
//! Console commands:
//!   status  - Show server status
//!   save    - Save every loaded world
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use classic_server::GameServer;
use classic_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    config: Option<PathBuf>,
    addr: Option<String>,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        config: None,
        addr: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                parsed.config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                parsed.addr = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    parsed
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = &args.addr {
        let (ip, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("--addr {addr:?} is not ip:port"))?;
        cfg.ip = ip.trim_matches(&['[', ']'][..]).to_string();
        cfg.port = port.parse().with_context(|| format!("parse port {port:?}"))?;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let cfg = load_config(&args)?;
    info!(addr = %cfg.listen_addr(), worlds_dir = %cfg.worlds_dir.display(), "Starting server");

    let server = GameServer::new(cfg);
    server.start().await.context("start server")?;

    // Spawn stdin reader thread.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("> ");
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

    println!("Server ready. Type 'status' for info, 'save' to save worlds, 'quit' to exit.");

    // A closed stdin leaves the server running until interrupted.
    let mut console_open = true;
    loop {
        tokio::select! {
            line = console_rx.recv(), if console_open => match line.as_deref() {
                Some("status") => {
                    let players = server.players().names();
                    let loaded: Vec<String> = server
                        .context()
                        .worlds
                        .loaded()
                        .iter()
                        .map(|w| w.name().to_string())
                        .collect();
                    println!(
                        "state: {}  addr: {}  players ({}): {}  loaded worlds: {}",
                        server.state(),
                        server
                            .local_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "-".into()),
                        players.len(),
                        players.join(", "),
                        loaded.join(", "),
                    );
                }
                Some("save") => match server.save_all().await {
                    Ok(saved) => println!("Saved {saved} world(s)."),
                    Err(e) => warn!(error = %e, "Save failed"),
                },
                Some("quit") => break,
                None => console_open = false,
                Some(other) => println!("Unknown command: {other}"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    server.stop().await.context("stop server")?;
    Ok(())
}
