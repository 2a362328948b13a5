//! Networking primitives.
//!
//! Goals:
//! - Encode/decode the fixed-width protocol primitives (64-byte strings,
//!   big-endian integers, fixed-point positions, angle bytes).
//! - Provide typed packets for both directions.
//! - Assemble each outbound packet in one buffer so a single `write_all`
//!   puts it on the wire.
//!
//! Packet ids are not globally unique: `0x00` is player identification from
//! the client and server identification from the server. Direction picks the
//! decoder.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u8 = 7;

/// Every protocol string occupies exactly this many bytes.
pub const STRING_LEN: usize = 64;

/// Payload bytes carried by one level data chunk packet.
pub const LEVEL_CHUNK_LEN: usize = 1024;

/// Player id a client uses to refer to itself.
pub const SELF_ID: u8 = 255;

/// Value of the identification padding byte announcing capability negotiation.
pub const CPE_MAGIC: u8 = 0x42;

pub const USER_TYPE_NORMAL: u8 = 0x00;
pub const USER_TYPE_OP: u8 = 0x64;

/// Set-block modes sent by the client.
pub const SET_BLOCK_DESTROY: u8 = 0x00;
pub const SET_BLOCK_CREATE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketId {
    Identification = 0x00,
    Ping = 0x01,
    LevelInitialize = 0x02,
    LevelDataChunk = 0x03,
    LevelFinalize = 0x04,
    ClientSetBlock = 0x05,
    ServerSetBlock = 0x06,
    SpawnPlayer = 0x07,
    PositionOrientation = 0x08,
    PositionOrientationUpdate = 0x09,
    PositionUpdate = 0x0a,
    OrientationUpdate = 0x0b,
    DespawnPlayer = 0x0c,
    Message = 0x0d,
    Kick = 0x0e,
    UpdateUserType = 0x0f,
    ExtInfo = 0x10,
    ExtEntry = 0x11,
}

impl PacketId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(PacketId::Identification),
            0x01 => Some(PacketId::Ping),
            0x02 => Some(PacketId::LevelInitialize),
            0x03 => Some(PacketId::LevelDataChunk),
            0x04 => Some(PacketId::LevelFinalize),
            0x05 => Some(PacketId::ClientSetBlock),
            0x06 => Some(PacketId::ServerSetBlock),
            0x07 => Some(PacketId::SpawnPlayer),
            0x08 => Some(PacketId::PositionOrientation),
            0x09 => Some(PacketId::PositionOrientationUpdate),
            0x0a => Some(PacketId::PositionUpdate),
            0x0b => Some(PacketId::OrientationUpdate),
            0x0c => Some(PacketId::DespawnPlayer),
            0x0d => Some(PacketId::Message),
            0x0e => Some(PacketId::Kick),
            0x0f => Some(PacketId::UpdateUserType),
            0x10 => Some(PacketId::ExtInfo),
            0x11 => Some(PacketId::ExtEntry),
            _ => None,
        }
    }
}

/// Errors raised while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown packet id {0:#04x}")]
    UnknownPacket(u8),
    #[error("packet {0:?} is not valid in this direction")]
    WrongDirection(PacketId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── Primitives ───

/// Encodes a protocol string: US-ASCII, right-padded with spaces, truncated
/// to [`STRING_LEN`] bytes. Non-ASCII characters become `?`.
pub fn encode_string(s: &str) -> [u8; STRING_LEN] {
    let mut out = [b' '; STRING_LEN];
    for (slot, ch) in out.iter_mut().zip(s.chars()) {
        *slot = if ch.is_ascii() { ch as u8 } else { b'?' };
    }
    out
}

/// Decodes a protocol string, trimming the trailing space padding.
pub fn decode_string(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect();
    text.trim_end_matches(' ').to_string()
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(&encode_string(s));
}

fn put_position(buf: &mut BytesMut, position: [i16; 3]) {
    for axis in position {
        buf.put_i16(axis);
    }
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let mut raw = [0u8; STRING_LEN];
    r.read_exact(&mut raw).await?;
    Ok(decode_string(&raw))
}

async fn read_position<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<[i16; 3]> {
    Ok([r.read_i16().await?, r.read_i16().await?, r.read_i16().await?])
}

async fn read_delta<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<[i8; 3]> {
    Ok([r.read_i8().await?, r.read_i8().await?, r.read_i8().await?])
}

// ─── Level transfer ───

/// One slice of the compressed level payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChunk<'a> {
    /// Unpadded bytes; at most [`LEVEL_CHUNK_LEN`].
    pub data: &'a [u8],
    pub percent: u8,
}

/// Number of chunk packets needed for a payload.
pub fn level_chunk_count(payload_len: usize) -> usize {
    payload_len.div_ceil(LEVEL_CHUNK_LEN)
}

/// Splits a compressed level payload into consecutive chunks. The percentage
/// of chunk `i` is `((i + 1) * 100) / count`.
pub fn level_chunks(payload: &[u8]) -> impl Iterator<Item = LevelChunk<'_>> {
    let count = level_chunk_count(payload.len());
    payload
        .chunks(LEVEL_CHUNK_LEN)
        .enumerate()
        .map(move |(i, data)| LevelChunk {
            data,
            percent: (((i + 1) * 100) / count) as u8,
        })
}

// ─── Server → client ───

#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    ServerIdentification {
        protocol_version: u8,
        name: String,
        motd: String,
        user_type: u8,
    },
    Ping,
    LevelInitialize,
    LevelDataChunk {
        /// Unpadded; the encoder pads to [`LEVEL_CHUNK_LEN`].
        data: Bytes,
        percent: u8,
    },
    LevelFinalize {
        width: i16,
        height: i16,
        depth: i16,
    },
    SetBlock {
        x: i16,
        y: i16,
        z: i16,
        block: u8,
    },
    SpawnPlayer {
        player_id: u8,
        name: String,
        position: [i16; 3],
        yaw: u8,
        pitch: u8,
    },
    PositionOrientation {
        player_id: u8,
        position: [i16; 3],
        yaw: u8,
        pitch: u8,
    },
    PositionOrientationUpdate {
        player_id: u8,
        delta: [i8; 3],
        yaw: u8,
        pitch: u8,
    },
    PositionUpdate {
        player_id: u8,
        delta: [i8; 3],
    },
    OrientationUpdate {
        player_id: u8,
        yaw: u8,
        pitch: u8,
    },
    DespawnPlayer {
        player_id: u8,
    },
    Message {
        player_id: u8,
        message: String,
    },
    Kick {
        reason: String,
    },
    UpdateUserType {
        user_type: u8,
    },
    ExtInfo {
        app_name: String,
        extension_count: i16,
    },
    ExtEntry {
        name: String,
        version: i32,
    },
}

impl ServerPacket {
    pub fn id(&self) -> PacketId {
        match self {
            ServerPacket::ServerIdentification { .. } => PacketId::Identification,
            ServerPacket::Ping => PacketId::Ping,
            ServerPacket::LevelInitialize => PacketId::LevelInitialize,
            ServerPacket::LevelDataChunk { .. } => PacketId::LevelDataChunk,
            ServerPacket::LevelFinalize { .. } => PacketId::LevelFinalize,
            ServerPacket::SetBlock { .. } => PacketId::ServerSetBlock,
            ServerPacket::SpawnPlayer { .. } => PacketId::SpawnPlayer,
            ServerPacket::PositionOrientation { .. } => PacketId::PositionOrientation,
            ServerPacket::PositionOrientationUpdate { .. } => PacketId::PositionOrientationUpdate,
            ServerPacket::PositionUpdate { .. } => PacketId::PositionUpdate,
            ServerPacket::OrientationUpdate { .. } => PacketId::OrientationUpdate,
            ServerPacket::DespawnPlayer { .. } => PacketId::DespawnPlayer,
            ServerPacket::Message { .. } => PacketId::Message,
            ServerPacket::Kick { .. } => PacketId::Kick,
            ServerPacket::UpdateUserType { .. } => PacketId::UpdateUserType,
            ServerPacket::ExtInfo { .. } => PacketId::ExtInfo,
            ServerPacket::ExtEntry { .. } => PacketId::ExtEntry,
        }
    }

    /// Serializes the packet, id byte included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + STRING_LEN * 2);
        buf.put_u8(self.id() as u8);
        match self {
            ServerPacket::ServerIdentification {
                protocol_version,
                name,
                motd,
                user_type,
            } => {
                buf.put_u8(*protocol_version);
                put_string(&mut buf, name);
                put_string(&mut buf, motd);
                buf.put_u8(*user_type);
            }
            ServerPacket::Ping | ServerPacket::LevelInitialize => {}
            ServerPacket::LevelDataChunk { data, percent } => {
                let len = data.len().min(LEVEL_CHUNK_LEN);
                buf.reserve(LEVEL_CHUNK_LEN + 3);
                buf.put_i16(len as i16);
                buf.put_slice(&data[..len]);
                buf.put_bytes(0, LEVEL_CHUNK_LEN - len);
                buf.put_u8(*percent);
            }
            ServerPacket::LevelFinalize {
                width,
                height,
                depth,
            } => {
                buf.put_i16(*width);
                buf.put_i16(*height);
                buf.put_i16(*depth);
            }
            ServerPacket::SetBlock { x, y, z, block } => {
                put_position(&mut buf, [*x, *y, *z]);
                buf.put_u8(*block);
            }
            ServerPacket::SpawnPlayer {
                player_id,
                name,
                position,
                yaw,
                pitch,
            } => {
                buf.put_u8(*player_id);
                put_string(&mut buf, name);
                put_position(&mut buf, *position);
                buf.put_u8(*yaw);
                buf.put_u8(*pitch);
            }
            ServerPacket::PositionOrientation {
                player_id,
                position,
                yaw,
                pitch,
            } => {
                buf.put_u8(*player_id);
                put_position(&mut buf, *position);
                buf.put_u8(*yaw);
                buf.put_u8(*pitch);
            }
            ServerPacket::PositionOrientationUpdate {
                player_id,
                delta,
                yaw,
                pitch,
            } => {
                buf.put_u8(*player_id);
                for d in delta {
                    buf.put_i8(*d);
                }
                buf.put_u8(*yaw);
                buf.put_u8(*pitch);
            }
            ServerPacket::PositionUpdate { player_id, delta } => {
                buf.put_u8(*player_id);
                for d in delta {
                    buf.put_i8(*d);
                }
            }
            ServerPacket::OrientationUpdate {
                player_id,
                yaw,
                pitch,
            } => {
                buf.put_u8(*player_id);
                buf.put_u8(*yaw);
                buf.put_u8(*pitch);
            }
            ServerPacket::DespawnPlayer { player_id } => buf.put_u8(*player_id),
            ServerPacket::Message { player_id, message } => {
                buf.put_u8(*player_id);
                put_string(&mut buf, message);
            }
            ServerPacket::Kick { reason } => put_string(&mut buf, reason),
            ServerPacket::UpdateUserType { user_type } => buf.put_u8(*user_type),
            ServerPacket::ExtInfo {
                app_name,
                extension_count,
            } => {
                put_string(&mut buf, app_name);
                buf.put_i16(*extension_count);
            }
            ServerPacket::ExtEntry { name, version } => {
                put_string(&mut buf, name);
                buf.put_i32(*version);
            }
        }
        buf.freeze()
    }

    /// Reads one server packet, id byte included.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let raw = r.read_u8().await?;
        let id = PacketId::from_u8(raw).ok_or(ProtocolError::UnknownPacket(raw))?;
        let packet = match id {
            PacketId::Identification => ServerPacket::ServerIdentification {
                protocol_version: r.read_u8().await?,
                name: read_string(r).await?,
                motd: read_string(r).await?,
                user_type: r.read_u8().await?,
            },
            PacketId::Ping => ServerPacket::Ping,
            PacketId::LevelInitialize => ServerPacket::LevelInitialize,
            PacketId::LevelDataChunk => {
                let len = r.read_i16().await?.clamp(0, LEVEL_CHUNK_LEN as i16) as usize;
                let mut padded = vec![0u8; LEVEL_CHUNK_LEN];
                r.read_exact(&mut padded).await?;
                padded.truncate(len);
                ServerPacket::LevelDataChunk {
                    data: Bytes::from(padded),
                    percent: r.read_u8().await?,
                }
            }
            PacketId::LevelFinalize => ServerPacket::LevelFinalize {
                width: r.read_i16().await?,
                height: r.read_i16().await?,
                depth: r.read_i16().await?,
            },
            PacketId::ServerSetBlock => {
                let [x, y, z] = read_position(r).await?;
                ServerPacket::SetBlock {
                    x,
                    y,
                    z,
                    block: r.read_u8().await?,
                }
            }
            PacketId::SpawnPlayer => ServerPacket::SpawnPlayer {
                player_id: r.read_u8().await?,
                name: read_string(r).await?,
                position: read_position(r).await?,
                yaw: r.read_u8().await?,
                pitch: r.read_u8().await?,
            },
            PacketId::PositionOrientation => ServerPacket::PositionOrientation {
                player_id: r.read_u8().await?,
                position: read_position(r).await?,
                yaw: r.read_u8().await?,
                pitch: r.read_u8().await?,
            },
            PacketId::PositionOrientationUpdate => ServerPacket::PositionOrientationUpdate {
                player_id: r.read_u8().await?,
                delta: read_delta(r).await?,
                yaw: r.read_u8().await?,
                pitch: r.read_u8().await?,
            },
            PacketId::PositionUpdate => ServerPacket::PositionUpdate {
                player_id: r.read_u8().await?,
                delta: read_delta(r).await?,
            },
            PacketId::OrientationUpdate => ServerPacket::OrientationUpdate {
                player_id: r.read_u8().await?,
                yaw: r.read_u8().await?,
                pitch: r.read_u8().await?,
            },
            PacketId::DespawnPlayer => ServerPacket::DespawnPlayer {
                player_id: r.read_u8().await?,
            },
            PacketId::Message => ServerPacket::Message {
                player_id: r.read_u8().await?,
                message: read_string(r).await?,
            },
            PacketId::Kick => ServerPacket::Kick {
                reason: read_string(r).await?,
            },
            PacketId::UpdateUserType => ServerPacket::UpdateUserType {
                user_type: r.read_u8().await?,
            },
            PacketId::ExtInfo => ServerPacket::ExtInfo {
                app_name: read_string(r).await?,
                extension_count: r.read_i16().await?,
            },
            PacketId::ExtEntry => ServerPacket::ExtEntry {
                name: read_string(r).await?,
                version: r.read_i32().await?,
            },
            PacketId::ClientSetBlock => return Err(ProtocolError::WrongDirection(id)),
        };
        Ok(packet)
    }
}

// ─── Client → server ───

#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Identification {
        protocol_version: u8,
        name: String,
        verification_key: String,
        /// Padding byte; [`CPE_MAGIC`] requests capability negotiation.
        marker: u8,
    },
    SetBlock {
        x: i16,
        y: i16,
        z: i16,
        mode: u8,
        block: u8,
    },
    PositionOrientation {
        player_id: u8,
        position: [i16; 3],
        yaw: u8,
        pitch: u8,
    },
    Message {
        player_id: u8,
        message: String,
    },
    ExtInfo {
        app_name: String,
        extension_count: i16,
    },
    ExtEntry {
        name: String,
        version: i32,
    },
}

impl ClientPacket {
    pub fn id(&self) -> PacketId {
        match self {
            ClientPacket::Identification { .. } => PacketId::Identification,
            ClientPacket::SetBlock { .. } => PacketId::ClientSetBlock,
            ClientPacket::PositionOrientation { .. } => PacketId::PositionOrientation,
            ClientPacket::Message { .. } => PacketId::Message,
            ClientPacket::ExtInfo { .. } => PacketId::ExtInfo,
            ClientPacket::ExtEntry { .. } => PacketId::ExtEntry,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + STRING_LEN * 2);
        buf.put_u8(self.id() as u8);
        match self {
            ClientPacket::Identification {
                protocol_version,
                name,
                verification_key,
                marker,
            } => {
                buf.put_u8(*protocol_version);
                put_string(&mut buf, name);
                put_string(&mut buf, verification_key);
                buf.put_u8(*marker);
            }
            ClientPacket::SetBlock {
                x,
                y,
                z,
                mode,
                block,
            } => {
                put_position(&mut buf, [*x, *y, *z]);
                buf.put_u8(*mode);
                buf.put_u8(*block);
            }
            ClientPacket::PositionOrientation {
                player_id,
                position,
                yaw,
                pitch,
            } => {
                buf.put_u8(*player_id);
                put_position(&mut buf, *position);
                buf.put_u8(*yaw);
                buf.put_u8(*pitch);
            }
            ClientPacket::Message { player_id, message } => {
                buf.put_u8(*player_id);
                put_string(&mut buf, message);
            }
            ClientPacket::ExtInfo {
                app_name,
                extension_count,
            } => {
                put_string(&mut buf, app_name);
                buf.put_i16(*extension_count);
            }
            ClientPacket::ExtEntry { name, version } => {
                put_string(&mut buf, name);
                buf.put_i32(*version);
            }
        }
        buf.freeze()
    }

    /// Reads the body of a client packet whose id byte was already consumed.
    pub async fn read_body<R: AsyncRead + Unpin>(
        raw_id: u8,
        r: &mut R,
    ) -> Result<Self, ProtocolError> {
        let id = PacketId::from_u8(raw_id).ok_or(ProtocolError::UnknownPacket(raw_id))?;
        let packet = match id {
            PacketId::Identification => ClientPacket::Identification {
                protocol_version: r.read_u8().await?,
                name: read_string(r).await?,
                verification_key: read_string(r).await?,
                marker: r.read_u8().await?,
            },
            PacketId::ClientSetBlock => {
                let [x, y, z] = read_position(r).await?;
                ClientPacket::SetBlock {
                    x,
                    y,
                    z,
                    mode: r.read_u8().await?,
                    block: r.read_u8().await?,
                }
            }
            PacketId::PositionOrientation => ClientPacket::PositionOrientation {
                player_id: r.read_u8().await?,
                position: read_position(r).await?,
                yaw: r.read_u8().await?,
                pitch: r.read_u8().await?,
            },
            PacketId::Message => ClientPacket::Message {
                player_id: r.read_u8().await?,
                message: read_string(r).await?,
            },
            PacketId::ExtInfo => ClientPacket::ExtInfo {
                app_name: read_string(r).await?,
                extension_count: r.read_i16().await?,
            },
            PacketId::ExtEntry => ClientPacket::ExtEntry {
                name: read_string(r).await?,
                version: r.read_i32().await?,
            },
            other => return Err(ProtocolError::WrongDirection(other)),
        };
        Ok(packet)
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let raw_id = r.read_u8().await?;
        Self::read_body(raw_id, r).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_string_is_space_padded_and_trimmed() {
        let raw = encode_string("Bob");
        assert_eq!(&raw[..3], b"Bob");
        assert!(raw[3..].iter().all(|&b| b == b' '));
        assert_eq!(decode_string(&raw), "Bob");
    }

    #[test]
    fn long_string_is_truncated_to_64_bytes() {
        let long = "x".repeat(70);
        let raw = encode_string(&long);
        assert_eq!(raw.len(), STRING_LEN);
        assert_eq!(decode_string(&raw), "x".repeat(64));
    }

    #[test]
    fn non_ascii_becomes_question_mark() {
        assert_eq!(decode_string(&encode_string("héllo")), "h?llo");
    }

    #[test]
    fn chunk_counts_for_boundary_lengths() {
        for (len, expected) in [(0, 0), (1, 1), (1024, 1), (1025, 2), (2048, 2)] {
            let payload = vec![7u8; len];
            let chunks: Vec<_> = level_chunks(&payload).collect();
            assert_eq!(chunks.len(), expected, "payload length {len}");
            assert_eq!(level_chunk_count(len), expected);

            for chunk in &chunks[..chunks.len().saturating_sub(1)] {
                assert_eq!(chunk.data.len(), LEVEL_CHUNK_LEN);
            }
            if let Some(last) = chunks.last() {
                let tail = match len % LEVEL_CHUNK_LEN {
                    0 => LEVEL_CHUNK_LEN,
                    rem => rem,
                };
                assert_eq!(last.data.len(), tail);
                assert_eq!(last.percent, 100);
            }
        }
    }

    #[test]
    fn chunk_percentages_climb_to_100() {
        let payload = vec![0u8; 3 * LEVEL_CHUNK_LEN];
        let percents: Vec<u8> = level_chunks(&payload).map(|c| c.percent).collect();
        assert_eq!(percents, vec![33, 66, 100]);
    }

    #[test]
    fn level_chunk_packet_is_padded() {
        let packet = ServerPacket::LevelDataChunk {
            data: Bytes::from_static(&[1, 2, 3]),
            percent: 50,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 1 + 2 + LEVEL_CHUNK_LEN + 1);
        assert_eq!(bytes[0], PacketId::LevelDataChunk as u8);
        assert_eq!(&bytes[1..3], &3i16.to_be_bytes());
        assert_eq!(&bytes[3..6], &[1, 2, 3]);
        assert!(bytes[6..3 + LEVEL_CHUNK_LEN].iter().all(|&b| b == 0));
        assert_eq!(bytes[bytes.len() - 1], 50);
    }

    #[test]
    fn identification_layout() {
        let bytes = ClientPacket::Identification {
            protocol_version: PROTOCOL_VERSION,
            name: "Steve".into(),
            verification_key: "key".into(),
            marker: CPE_MAGIC,
        }
        .encode();
        assert_eq!(bytes.len(), 1 + 1 + STRING_LEN * 2 + 1);
        assert_eq!(bytes[1], 7);
        assert_eq!(bytes[bytes.len() - 1], 0x42);
    }

    #[tokio::test]
    async fn spawn_packet_decodes_from_wire() -> Result<(), ProtocolError> {
        let packet = ServerPacket::SpawnPlayer {
            player_id: SELF_ID,
            name: "Steve".into(),
            position: [2048, 2099, 2048],
            yaw: 248,
            pitch: 0,
        };
        let bytes = packet.encode();
        let mut reader = &bytes[..];
        assert_eq!(ServerPacket::read(&mut reader).await?, packet);
        assert!(reader.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn server_only_ids_are_rejected_from_clients() {
        let mut reader: &[u8] = &[PacketId::Kick as u8];
        let err = ClientPacket::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::WrongDirection(PacketId::Kick)));

        let mut reader: &[u8] = &[0x7f];
        let err = ClientPacket::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPacket(0x7f)));
    }
}
