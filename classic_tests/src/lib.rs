//! Shared helpers for the integration tests.

use std::net::SocketAddr;

use anyhow::Context;
use classic_server::GameServer;
use classic_shared::config::ServerConfig;
use tempfile::TempDir;

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Loopback config on an ephemeral port with worlds under `dir`.
pub fn test_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        worlds_dir: dir.path().join("worlds"),
        verify_names: false,
        save_interval_secs: 0,
        ..Default::default()
    }
}

/// A started server and the directory holding its worlds.
pub struct TestServer {
    pub server: GameServer,
    pub addr: SocketAddr,
    pub dir: TempDir,
}

/// Starts a server on an ephemeral loopback port.
pub async fn start_ephemeral(
    tweak: impl FnOnce(&mut ServerConfig),
) -> anyhow::Result<TestServer> {
    init_tracing();
    let dir = tempfile::tempdir().context("create temp dir")?;
    let mut cfg = test_config(&dir);
    tweak(&mut cfg);
    let server = GameServer::new(cfg);
    server.start().await.context("start server")?;
    let addr = server.local_addr().context("server has no local address")?;
    Ok(TestServer { server, addr, dir })
}
