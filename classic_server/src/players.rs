//! Server-wide roster of spawned players.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use classic_shared::net::{ServerPacket, SELF_ID};
use tracing::debug;

use crate::session::output::PacketWriter;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("the server is full")]
    Full,
    #[error("already logged in")]
    AlreadyOnline,
}

struct PlayerEntry {
    name: String,
    world: Option<String>,
    output: Arc<PacketWriter>,
}

/// Maps one-byte player ids to names, worlds and output handles.
pub struct PlayerList {
    max_players: usize,
    players: Mutex<BTreeMap<u8, PlayerEntry>>,
}

impl PlayerList {
    pub fn new(max_players: usize) -> Self {
        Self {
            max_players,
            players: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u8, PlayerEntry>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a player and returns the lowest free id. Names compare
    /// case-insensitively.
    pub fn admit(&self, name: &str, output: Arc<PacketWriter>) -> Result<u8, AdmitError> {
        let mut players = self.lock();
        if players.values().any(|p| p.name.eq_ignore_ascii_case(name)) {
            return Err(AdmitError::AlreadyOnline);
        }
        if players.len() >= self.max_players {
            return Err(AdmitError::Full);
        }
        let id = (0..SELF_ID)
            .find(|id| !players.contains_key(id))
            .ok_or(AdmitError::Full)?;
        players.insert(
            id,
            PlayerEntry {
                name: name.to_string(),
                world: None,
                output,
            },
        );
        Ok(id)
    }

    pub fn remove(&self, id: u8) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn set_world(&self, id: u8, world: &str) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.world = Some(world.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Names of online players, ordered by id.
    pub fn names(&self) -> Vec<String> {
        self.lock().values().map(|p| p.name.clone()).collect()
    }

    fn outputs<F>(&self, filter: F) -> Vec<Arc<PacketWriter>>
    where
        F: Fn(u8, &PlayerEntry) -> bool,
    {
        self.lock()
            .iter()
            .filter(|(id, entry)| filter(**id, entry))
            .map(|(_, entry)| Arc::clone(&entry.output))
            .collect()
    }

    /// Queues a packet for every player.
    pub fn broadcast(&self, packet: &ServerPacket) {
        push_to(self.outputs(|_, _| true), packet);
    }

    /// Queues a packet for every player in `world` except `except`.
    pub fn broadcast_world(&self, world: &str, except: u8, packet: &ServerPacket) {
        let targets =
            self.outputs(|id, entry| id != except && entry.world.as_deref() == Some(world));
        push_to(targets, packet);
    }
}

// Never waits on a receiver. A player whose queue is full is dropped by its
// own writer, and its session notices on its own.
fn push_to(targets: Vec<Arc<PacketWriter>>, packet: &ServerPacket) {
    for output in targets {
        if !output.push(packet) {
            debug!("Broadcast skipped a closed or stalled player");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> Arc<PacketWriter> {
        Arc::new(PacketWriter::new(tokio::io::sink()))
    }

    #[tokio::test]
    async fn ids_are_reused_lowest_first() {
        let players = PlayerList::new(8);
        assert_eq!(players.admit("a", sink()), Ok(0));
        assert_eq!(players.admit("b", sink()), Ok(1));
        assert!(players.remove(0));
        assert_eq!(players.admit("c", sink()), Ok(0));
        assert_eq!(players.names(), vec!["c".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn full_and_duplicate_are_rejected() {
        let players = PlayerList::new(1);
        players.admit("Steve", sink()).unwrap();
        assert_eq!(players.admit("steve", sink()), Err(AdmitError::AlreadyOnline));
        assert_eq!(players.admit("Alex", sink()), Err(AdmitError::Full));
        assert_eq!(players.len(), 1);
    }

    #[tokio::test]
    async fn world_broadcast_skips_sender_and_other_worlds() {
        let players = PlayerList::new(8);
        let (mut a_rx, a_tx) = tokio::io::duplex(1024);
        let (mut b_rx, b_tx) = tokio::io::duplex(1024);
        let a = players.admit("a", Arc::new(PacketWriter::new(a_tx))).unwrap();
        let b = players.admit("b", Arc::new(PacketWriter::new(b_tx))).unwrap();
        let c = players.admit("c", sink()).unwrap();
        players.set_world(a, "main");
        players.set_world(b, "main");
        players.set_world(c, "other");

        players.broadcast_world("main", a, &ServerPacket::Ping);
        players.broadcast(&ServerPacket::LevelInitialize);

        assert_eq!(ServerPacket::read(&mut b_rx).await.unwrap(), ServerPacket::Ping);
        assert_eq!(
            ServerPacket::read(&mut b_rx).await.unwrap(),
            ServerPacket::LevelInitialize
        );
        assert_eq!(
            ServerPacket::read(&mut a_rx).await.unwrap(),
            ServerPacket::LevelInitialize
        );
    }

    #[tokio::test]
    async fn stalled_player_does_not_hold_up_the_others() {
        let players = PlayerList::new(8);
        let (_unread, stalled_tx) = tokio::io::duplex(16);
        let (mut healthy_rx, healthy_tx) = tokio::io::duplex(64 * 1024);
        let stalled = Arc::new(PacketWriter::with_limits(
            stalled_tx,
            4,
            crate::session::output::STALL_TIMEOUT,
        ));
        players.admit("stuck", Arc::clone(&stalled)).unwrap();
        players.admit("fine", Arc::new(PacketWriter::new(healthy_tx))).unwrap();

        for i in 0..32 {
            players.broadcast(&ServerPacket::Message {
                player_id: SELF_ID,
                message: format!("line {i}"),
            });
        }
        assert!(stalled.is_closed());
        for i in 0..32 {
            assert_eq!(
                ServerPacket::read(&mut healthy_rx).await.unwrap(),
                ServerPacket::Message {
                    player_id: SELF_ID,
                    message: format!("line {i}"),
                }
            );
        }
    }
}
