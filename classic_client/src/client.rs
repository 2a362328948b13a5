//! Client implementation.
//!
//! The client performs:
//! - The identification handshake, optionally with capability negotiation
//! - Level download, reassembly and decompression
//! - Packet receive plus chat, movement and block edit sends

use std::io::Read;
use std::net::SocketAddr;

use anyhow::{bail, Context};
use classic_shared::math::{Orientation, Position};
use classic_shared::net::{
    ClientPacket, ServerPacket, CPE_MAGIC, PROTOCOL_VERSION, SELF_ID, SET_BLOCK_CREATE,
    SET_BLOCK_DESTROY, USER_TYPE_OP,
};
use flate2::read::GzDecoder;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Application name sent during capability negotiation.
pub const CLIENT_NAME: &str = concat!("classic_client ", env!("CARGO_PKG_VERSION"));

/// The server closed the session with a reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("kicked: {0}")]
pub struct Kicked(pub String);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake in progress.
    Connecting,
    /// Receiving level data.
    LoadingLevel,
    /// Spawned and playing.
    Ready,
}

#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub name: String,
    pub verification_key: String,
    /// Request capability negotiation.
    pub negotiate: bool,
}

impl LoginOptions {
    pub fn new(name: &str, verification_key: &str) -> Self {
        Self {
            name: name.to_string(),
            verification_key: verification_key.to_string(),
            negotiate: false,
        }
    }
}

/// A downloaded level.
#[derive(Debug, Clone)]
pub struct Level {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub blocks: Vec<u8>,
    /// Length of the gzip payload as received.
    pub compressed_len: usize,
    /// Percentages of each received chunk, in order.
    pub chunk_percents: Vec<u8>,
}

impl Level {
    pub fn block(&self, x: usize, y: usize, z: usize) -> Option<u8> {
        if x >= self.width || y >= self.height || z >= self.depth {
            return None;
        }
        self.blocks.get((y * self.depth + z) * self.width + x).copied()
    }
}

/// Gunzips a level payload and strips its block count prefix.
pub fn decode_level(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut raw = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut raw)
        .context("gunzip level")?;
    if raw.len() < 4 {
        bail!("level payload too short: {} bytes", raw.len());
    }
    let count = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let blocks = raw.split_off(4);
    if blocks.len() != count {
        bail!("level announces {count} blocks but holds {}", blocks.len());
    }
    Ok(blocks)
}

/// High-level protocol client.
pub struct GameClient {
    pub state: ClientState,
    pub server_name: String,
    pub server_motd: String,
    pub operator: bool,
    pub level: Option<Level>,
    pub position: Position,
    pub orientation: Orientation,
    /// Chat lines received so far.
    pub server_messages: Vec<String>,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GameClient {
    /// Connects and logs in without capability negotiation.
    pub async fn connect(addr: SocketAddr, name: &str, key: &str) -> anyhow::Result<Self> {
        Self::connect_with(addr, &LoginOptions::new(name, key)).await
    }

    /// Connects, logs in and downloads the first level.
    pub async fn connect_with(addr: SocketAddr, opts: &LoginOptions) -> anyhow::Result<Self> {
        info!(server = %addr, name = %opts.name, "Connecting to server");
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("set nodelay")?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            state: ClientState::Connecting,
            server_name: String::new(),
            server_motd: String::new(),
            operator: false,
            level: None,
            position: Position::ZERO,
            orientation: Orientation::new(0.0, 0.0),
            server_messages: Vec::new(),
            reader: BufReader::new(reader),
            writer,
        };
        client.login(opts).await?;
        client.load_level().await?;
        Ok(client)
    }

    async fn login(&mut self, opts: &LoginOptions) -> anyhow::Result<()> {
        self.send(&ClientPacket::Identification {
            protocol_version: PROTOCOL_VERSION,
            name: opts.name.clone(),
            verification_key: opts.verification_key.clone(),
            marker: if opts.negotiate { CPE_MAGIC } else { 0 },
        })
        .await?;

        if opts.negotiate {
            let offered = match self.recv_checked().await? {
                ServerPacket::ExtInfo {
                    app_name,
                    extension_count,
                } => {
                    debug!(server = %app_name, extension_count, "Server capabilities");
                    extension_count
                }
                other => bail!("expected ext info, got {:?}", other.id()),
            };
            for _ in 0..offered.max(0) {
                match self.recv_checked().await? {
                    ServerPacket::ExtEntry { name, version } => {
                        debug!(extension = %name, version, "Server extension");
                    }
                    other => bail!("expected ext entry, got {:?}", other.id()),
                }
            }
            self.send(&ClientPacket::ExtInfo {
                app_name: CLIENT_NAME.to_string(),
                extension_count: 0,
            })
            .await?;
        }

        match self.recv_checked().await? {
            ServerPacket::ServerIdentification {
                protocol_version,
                name,
                motd,
                user_type,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    bail!("server speaks protocol {protocol_version}");
                }
                info!(server = %name, %motd, "Logged in");
                self.server_name = name;
                self.server_motd = motd;
                self.operator = user_type == USER_TYPE_OP;
                Ok(())
            }
            other => bail!("expected server identification, got {:?}", other.id()),
        }
    }

    /// Receives a level and the self spawn that follows it.
    pub async fn load_level(&mut self) -> anyhow::Result<()> {
        loop {
            match self.recv_checked().await? {
                ServerPacket::LevelInitialize => break,
                ServerPacket::Ping => {}
                other => bail!("expected level initialize, got {:?}", other.id()),
            }
        }
        self.state = ClientState::LoadingLevel;

        let mut payload = Vec::new();
        let mut chunk_percents = Vec::new();
        let (width, height, depth) = loop {
            match self.recv_checked().await? {
                ServerPacket::LevelDataChunk { data, percent } => {
                    payload.extend_from_slice(&data);
                    chunk_percents.push(percent);
                }
                ServerPacket::LevelFinalize {
                    width,
                    height,
                    depth,
                } => break (width as usize, height as usize, depth as usize),
                other => bail!("unexpected {:?} during level transfer", other.id()),
            }
        };

        let blocks = decode_level(&payload)?;
        if blocks.len() != width * height * depth {
            bail!(
                "level holds {} blocks, expected {width}x{height}x{depth}",
                blocks.len()
            );
        }
        info!(width, height, depth, bytes = payload.len(), "Level loaded");
        self.level = Some(Level {
            width,
            height,
            depth,
            blocks,
            compressed_len: payload.len(),
            chunk_percents,
        });

        loop {
            match self.recv_checked().await? {
                ServerPacket::SpawnPlayer {
                    player_id: SELF_ID,
                    position,
                    yaw,
                    pitch,
                    ..
                } => {
                    self.position = Position::from_fixed(position);
                    self.orientation = Orientation::from_bytes(yaw, pitch);
                }
                ServerPacket::PositionOrientation {
                    player_id: SELF_ID,
                    position,
                    yaw,
                    pitch,
                } => {
                    self.position = Position::from_fixed(position);
                    self.orientation = Orientation::from_bytes(yaw, pitch);
                    break;
                }
                _ => {}
            }
        }
        self.state = ClientState::Ready;
        Ok(())
    }

    /// Receives the next packet, recording chat lines.
    pub async fn recv(&mut self) -> anyhow::Result<ServerPacket> {
        let packet = ServerPacket::read(&mut self.reader)
            .await
            .context("read packet")?;
        if let ServerPacket::Message { message, .. } = &packet {
            self.server_messages.push(message.clone());
        }
        Ok(packet)
    }

    /// Like [`GameClient::recv`], but a kick becomes a [`Kicked`] error.
    pub async fn recv_checked(&mut self) -> anyhow::Result<ServerPacket> {
        match self.recv().await? {
            ServerPacket::Kick { reason } => Err(Kicked(reason).into()),
            packet => Ok(packet),
        }
    }

    pub async fn send(&mut self, packet: &ClientPacket) -> anyhow::Result<()> {
        self.writer
            .write_all(&packet.encode())
            .await
            .context("tcp write")?;
        Ok(())
    }

    pub async fn say(&mut self, message: &str) -> anyhow::Result<()> {
        self.send(&ClientPacket::Message {
            player_id: SELF_ID,
            message: message.to_string(),
        })
        .await
    }

    pub async fn set_block(&mut self, at: [i16; 3], block: Option<u8>) -> anyhow::Result<()> {
        let [x, y, z] = at;
        self.send(&ClientPacket::SetBlock {
            x,
            y,
            z,
            mode: if block.is_some() {
                SET_BLOCK_CREATE
            } else {
                SET_BLOCK_DESTROY
            },
            block: block.unwrap_or(0),
        })
        .await
    }

    pub async fn move_to(&mut self, position: Position, orientation: Orientation) -> anyhow::Result<()> {
        let (yaw, pitch) = orientation.to_bytes();
        self.position = position;
        self.orientation = orientation;
        self.send(&ClientPacket::PositionOrientation {
            player_id: SELF_ID,
            position: position.to_fixed(),
            yaw,
            pitch,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decode_level_strips_count() {
        let mut raw = 3u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_level(&gzip(&raw)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn decode_level_rejects_count_mismatch() {
        let mut raw = 5u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        assert!(decode_level(&gzip(&raw)).is_err());
        assert!(decode_level(b"not gzip").is_err());
    }

    #[test]
    fn level_block_lookup_is_y_major() {
        let mut blocks = vec![0u8; 16 * 16 * 16];
        blocks[(2 * 16 + 3) * 16 + 1] = 9;
        let level = Level {
            width: 16,
            height: 16,
            depth: 16,
            blocks,
            compressed_len: 0,
            chunk_percents: Vec::new(),
        };
        assert_eq!(level.block(1, 2, 3), Some(9));
        assert_eq!(level.block(16, 0, 0), None);
    }
}
