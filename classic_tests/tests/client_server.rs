//! Socket-level integration tests: a real server on loopback and protocol
//! clients talking to it.

use std::time::Duration;

use classic_client::{GameClient, Kicked, LoginOptions};
use classic_shared::block::Block;
use classic_shared::net::{level_chunk_count, ServerPacket};
use classic_tests::start_ephemeral;

const WAIT: Duration = Duration::from_secs(10);

/// Reads packets until a chat line equal to `expected` arrives.
async fn wait_for_message(client: &mut GameClient, expected: &str) -> anyhow::Result<()> {
    tokio::time::timeout(WAIT, async {
        loop {
            if let ServerPacket::Message { message, .. } = client.recv_checked().await? {
                if message == expected {
                    return Ok(());
                }
            }
        }
    })
    .await?
}

/// Connects and waits until the player's own join announcement, sent after
/// the world switch completes.
async fn join(addr: std::net::SocketAddr, name: &str) -> anyhow::Result<GameClient> {
    let mut client = GameClient::connect(addr, name, "-").await?;
    wait_for_message(&mut client, &format!("&e{name} joined the game")).await?;
    Ok(client)
}

fn kick_reason(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<Kicked>().map(|k| k.0.as_str())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_server_streams_generated_world() -> anyhow::Result<()> {
    let t = start_ephemeral(|cfg| cfg.verify_names = true).await?;

    // The default world and rank were created during start.
    let world = t.server.lookup_world("main").expect("default world");
    assert!(world.is_loaded());
    assert!(t.dir.path().join("worlds").join("main.world").exists());
    let guest = t.server.lookup_rank("guest").expect("default rank");
    assert_eq!(guest.permission_level, 0);
    assert!(!guest.operator);

    let key = t.server.salt().expect("salt while started").expected_key("Steve");
    let client = GameClient::connect(t.addr, "Steve", &key).await?;
    assert_eq!(client.server_name, "Classic Server");
    assert!(!client.operator);

    let level = client.level.as_ref().expect("level downloaded");
    assert_eq!((level.width, level.height, level.depth), (128, 128, 128));
    assert_eq!(level.blocks.len(), 128 * 128 * 128);
    assert_eq!(level.compressed_len, world.compressed_blocks()?.len());
    assert_eq!(level.chunk_percents.len(), level_chunk_count(level.compressed_len));
    assert_eq!(level.chunk_percents.last(), Some(&100));
    assert!(level.chunk_percents.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(level.block(0, 0, 0), Some(Block::Dirt.id()));
    assert_eq!(level.block(10, 63, 10), Some(Block::Dirt.id()));
    assert_eq!(level.block(10, 64, 10), Some(Block::Grass.id()));
    assert_eq!(level.block(10, 65, 10), Some(Block::Air.id()));

    assert_eq!(client.position.x, 64.0);
    assert!((client.position.y - 65.59375).abs() < 1.0 / 32.0);
    assert_eq!(client.position.z, 64.0);

    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_verification_key_is_kicked() -> anyhow::Result<()> {
    let t = start_ephemeral(|cfg| cfg.verify_names = true).await?;

    let err = GameClient::connect(t.addr, "Steve", "0123456789abcdef")
        .await
        .err()
        .expect("login must fail");
    assert_eq!(kick_reason(&err), Some("name verification failed"));
    assert!(t.server.players().is_empty());

    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn uppercase_verification_key_is_accepted() -> anyhow::Result<()> {
    let t = start_ephemeral(|cfg| cfg.verify_names = true).await?;
    let key = t.server.salt().expect("salt").expected_key("Alex").to_uppercase();
    GameClient::connect(t.addr, "Alex", &key).await?;
    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn capability_negotiation_login() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    let opts = LoginOptions {
        negotiate: true,
        ..LoginOptions::new("Steve", "-")
    };
    let client = GameClient::connect_with(t.addr, &opts).await?;
    assert!(client.level.is_some());
    t.server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_reaches_other_players() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    let mut alice = join(t.addr, "Alice").await?;
    let mut bob = join(t.addr, "Bob").await?;

    alice.say("hello bob").await?;
    wait_for_message(&mut bob, "&7Alice: &fhello bob").await?;
    wait_for_message(&mut alice, "&7Alice: &fhello bob").await?;

    t.server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_edits_reach_world_and_players() -> anyhow::Result<()> {
    let t = start_ephemeral(|_| {}).await?;
    let mut alice = join(t.addr, "Alice").await?;
    let mut bob = join(t.addr, "Bob").await?;

    alice.set_block([5, 70, 5], Some(Block::Glass.id())).await?;
    let echoed = tokio::time::timeout(WAIT, async {
        loop {
            if let packet @ ServerPacket::SetBlock { .. } = bob.recv_checked().await? {
                return anyhow::Ok(packet);
            }
        }
    })
    .await??;
    assert_eq!(
        echoed,
        ServerPacket::SetBlock {
            x: 5,
            y: 70,
            z: 5,
            block: Block::Glass.id()
        }
    );
    let world = t.server.lookup_world("main").expect("default world");
    assert_eq!(world.block(5, 70, 5)?, Some(Block::Glass.id()));

    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn full_server_turns_players_away() -> anyhow::Result<()> {
    let t = start_ephemeral(|cfg| cfg.max_players = 1).await?;
    let _first = join(t.addr, "First").await?;

    let err = GameClient::connect(t.addr, "Second", "-")
        .await
        .err()
        .expect("second login must fail");
    assert_eq!(kick_reason(&err), Some("the server is full"));

    t.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn operators_are_flagged() -> anyhow::Result<()> {
    let t = start_ephemeral(|cfg| {
        cfg.ranks
            .push(classic_shared::rank::Rank::new("admin", 'c', 100, true));
        cfg.player_ranks.insert("Notch".into(), "admin".into());
    })
    .await?;
    let client = GameClient::connect(t.addr, "Notch", "-").await?;
    assert!(client.operator);
    t.server.stop().await?;
    Ok(())
}
