//! Lifecycle smoke tests and raw-socket protocol checks.

use std::time::Duration;

use classic_client::GameClient;
use classic_server::{GameServer, ServerError, ServerState};
use classic_shared::net::{ClientPacket, ServerPacket, PROTOCOL_VERSION};
use classic_tests::{init_tracing, start_ephemeral, test_config};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(10);

async fn next_kick(stream: &mut TcpStream) -> anyhow::Result<String> {
    tokio::time::timeout(WAIT, async {
        loop {
            if let ServerPacket::Kick { reason } = ServerPacket::read(stream).await? {
                return anyhow::Ok(reason);
            }
        }
    })
    .await?
}

#[tokio::test]
async fn server_starts_stops_and_restarts() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let server = GameServer::new(test_config(&dir));
    assert_eq!(server.state(), ServerState::Stopped);

    server.start().await?;
    assert_eq!(server.state(), ServerState::Started);
    assert!(server.salt().is_some());
    let first_salt = server.salt();

    server.stop().await?;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.salt().is_none());
    assert!(matches!(
        server.verify_name("Steve", "x"),
        Err(ServerError::NotStarted)
    ));

    server.start().await?;
    assert_eq!(server.state(), ServerState::Started);
    assert_ne!(server.salt(), first_salt);
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_lifecycle_calls_are_rejected() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let server = GameServer::new(test_config(&dir));

    let err = server.stop().await.expect_err("stop while stopped");
    assert!(err.is_logic_error());
    assert_eq!(server.state(), ServerState::Stopped);

    server.start().await?;
    let err = server.start().await.expect_err("start while started");
    assert!(err.is_logic_error());
    assert_eq!(server.state(), ServerState::Started);
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stopped_server_refuses_connections() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    t.server.stop().await?;
    assert!(TcpStream::connect(t.addr).await.is_err());
    Ok(())
}

#[tokio::test]
async fn stop_kicks_connected_players() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    let mut client = GameClient::connect(t.addr, "Steve", "-").await?;

    t.server.stop().await?;
    let reason = tokio::time::timeout(WAIT, async {
        loop {
            if let ServerPacket::Kick { reason } = client.recv().await? {
                return anyhow::Ok(reason);
            }
        }
    })
    .await??;
    assert_eq!(reason, "the server is stopping");
    Ok(())
}

#[tokio::test]
async fn silent_client_is_kicked_after_login_timeout() -> anyhow::Result<()> {
    let t = start_ephemeral(|cfg| cfg.login_timeout_ms = 200).await?;
    let mut stream = TcpStream::connect(t.addr).await?;
    assert_eq!(next_kick(&mut stream).await?, "you took too long to login");
    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_first_packet_is_kicked() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    let mut stream = TcpStream::connect(t.addr).await?;
    stream
        .write_all(
            &ClientPacket::Message {
                player_id: 0,
                message: "hi".into(),
            }
            .encode(),
        )
        .await?;
    assert_eq!(
        next_kick(&mut stream).await?,
        "expected first packet to be player identification"
    );
    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_protocol_version_is_kicked() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    let mut stream = TcpStream::connect(t.addr).await?;
    stream
        .write_all(
            &ClientPacket::Identification {
                protocol_version: PROTOCOL_VERSION - 1,
                name: "Steve".into(),
                verification_key: "-".into(),
                marker: 0,
            }
            .encode(),
        )
        .await?;
    assert_eq!(next_kick(&mut stream).await?, "wrong protocol version");
    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn world_survives_restart() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let server = GameServer::new(test_config(&dir));
    server.start().await?;
    let world = server.lookup_world("main").expect("default world");
    world.set_block(3, 90, 3, 42)?;
    server.stop().await?;

    let reopened = GameServer::new(test_config(&dir));
    reopened.start().await?;
    let world = reopened.lookup_world("main").expect("default world");
    assert_eq!(world.block(3, 90, 3)?, Some(42));
    reopened.stop().await?;
    Ok(())
}
