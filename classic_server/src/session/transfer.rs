//! Level transfer: streams a world to one client and places the player at
//! its spawn point.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use classic_shared::net::{level_chunks, ServerPacket, SELF_ID};
use tracing::debug;

use super::output::PacketWriter;
use super::SessionError;
use crate::world::World;

/// Sends the full level sequence for `world` to `output`.
pub async fn send_world(
    output: &PacketWriter,
    world: &Arc<World>,
    player_name: &str,
) -> Result<(), SessionError> {
    output.send(&ServerPacket::LevelInitialize).await?;

    let payload = {
        let world = Arc::clone(world);
        tokio::task::spawn_blocking(move || world.compressed_blocks())
            .await
            .map_err(io::Error::other)??
    };

    let mut chunks = 0usize;
    for chunk in level_chunks(&payload) {
        output
            .send(&ServerPacket::LevelDataChunk {
                data: Bytes::copy_from_slice(chunk.data),
                percent: chunk.percent,
            })
            .await?;
        chunks += 1;
    }
    debug!(world = %world.name(), bytes = payload.len(), chunks, "Level data sent");

    let dims = world.dims();
    output
        .send(&ServerPacket::LevelFinalize {
            width: dims.width as i16,
            height: dims.height as i16,
            depth: dims.depth as i16,
        })
        .await?;

    let position = world.spawn().to_fixed();
    let (yaw, pitch) = world.spawn_orientation().to_bytes();
    let welcome = match world.motd() {
        Some(motd) => motd.to_string(),
        None => format!("&eWelcome to {}", world.name()),
    };
    output
        .send_all(&[
            ServerPacket::SpawnPlayer {
                player_id: SELF_ID,
                name: player_name.to_string(),
                position,
                yaw,
                pitch,
            },
            ServerPacket::PositionOrientation {
                player_id: SELF_ID,
                position,
                yaw,
                pitch,
            },
            ServerPacket::Message {
                player_id: SELF_ID,
                message: welcome,
            },
        ])
        .await?;
    Ok(())
}
