//! Per-connection protocol state machine.
//!
//! ```text
//! AwaitingHello -> Verifying -> [NegotiatingCapabilities] -> Spawning -> Active -> Closed
//! ```
//!
//! Every phase can fall straight to `Closed` on an I/O failure, a kick, or
//! cancellation of the session's shutdown token. A login timer runs from
//! accept until spawning starts; if it fires first it kicks the client and
//! cancels the shutdown token.
//!
//! World switches run on their own tasks, one at a time per session in
//! request order, and report back through a oneshot channel.

pub mod output;
pub mod transfer;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use classic_shared::block::Block;
use classic_shared::math::{Orientation, Position};
use classic_shared::net::{
    read_string, ClientPacket, PacketId, ProtocolError, ServerPacket, CPE_MAGIC,
    PROTOCOL_VERSION, SELF_ID, SET_BLOCK_CREATE, SET_BLOCK_DESTROY, USER_TYPE_NORMAL,
    USER_TYPE_OP,
};
use classic_shared::rank::Rank;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::{ServerContext, ServerError};
use crate::world::{World, WorldError, WorldLoadState};
use output::{PacketWriter, CLOSE_GRACE};

/// Application name sent during capability negotiation.
pub const SOFTWARE_NAME: &str = concat!("classic_server ", env!("CARGO_PKG_VERSION"));

/// Longest accepted player name.
pub const MAX_NAME_LEN: usize = 16;

pub const KICK_EXPECTED_IDENTIFICATION: &str = "expected first packet to be player identification";
pub const KICK_WRONG_PROTOCOL: &str = "wrong protocol version";
pub const KICK_VERIFICATION_FAILED: &str = "name verification failed";
pub const KICK_INVALID_NAME: &str = "invalid player name";
pub const KICK_LOGIN_TIMEOUT: &str = "you took too long to login";
pub const KICK_UNEXPECTED_NEGOTIATION: &str = "unexpected packet during capability negotiation";
pub const KICK_UNEXPECTED_PACKET: &str = "unexpected packet";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHello,
    Verifying,
    NegotiatingCapabilities,
    Spawning,
    Active,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was cancelled, by the login timer or a server stop.
    #[error("session closed")]
    Closed,
    /// A protocol violation; the reason is sent to the client.
    #[error("kicked: {0}")]
    Kick(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

fn kick(reason: impl Into<String>) -> SessionError {
    SessionError::Kick(reason.into())
}

/// Names are 1 to 16 characters of `[A-Za-z0-9_.]`.
pub fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

/// Awaits `fut` unless the session is shut down first.
async fn until_closed<T, E, F>(shutdown: &CancellationToken, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, E>>,
    SessionError: From<E>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(SessionError::Closed),
        result = fut => result.map_err(SessionError::from),
    }
}

struct Player {
    id: u8,
    name: String,
    rank: Rank,
    world: Option<Arc<World>>,
    position: Position,
    orientation: Orientation,
}

pub struct Session<R> {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    reader: R,
    output: Arc<PacketWriter>,
    phase: SessionPhase,
    shutdown: CancellationToken,
    /// Cancelled when the most recently requested switch finishes.
    last_switch: Option<CancellationToken>,
    player: Option<Player>,
}

type PendingSwitch = oneshot::Receiver<Result<Arc<World>, SessionError>>;

/// One world switch, run on its own task.
struct SwitchJob {
    ctx: Arc<ServerContext>,
    output: Arc<PacketWriter>,
    player_id: u8,
    player_name: String,
    rank: Rank,
    world: Arc<World>,
}

impl SwitchJob {
    async fn run(self) -> Result<Arc<World>, SessionError> {
        let world = self.world;
        if !self.rank.permits(world.visit_permission()) {
            return Err(kick(format!("you are not allowed to visit {}", world.name())));
        }

        let mut state = world.settled_state().await;
        if state == WorldLoadState::Unloaded {
            let formats = self.ctx.formats.clone();
            let loading = Arc::clone(&world);
            match tokio::task::spawn_blocking(move || loading.load(&formats))
                .await
                .map_err(io::Error::other)?
            {
                Ok(()) => {}
                // Another session started loading it first.
                Err(e) if e.is_logic_error() => {}
                Err(e) => return Err(e.into()),
            }
            state = world.settled_state().await;
        }
        if state != WorldLoadState::Loaded {
            return Err(kick(format!("world {} is unavailable", world.name())));
        }

        transfer::send_world(&self.output, &world, &self.player_name).await?;
        self.ctx.players.set_world(self.player_id, world.name());
        Ok(world)
    }
}

/// Outcome of a block edit, decided under the world's grid lock.
enum Edit {
    Applied(u8),
    Refused { current: u8 },
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new<W>(ctx: Arc<ServerContext>, peer: SocketAddr, reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shutdown = ctx.session_token();
        Self {
            ctx,
            peer,
            reader,
            output: Arc::new(PacketWriter::new(writer)),
            phase: SessionPhase::AwaitingHello,
            shutdown,
            last_switch: None,
            player: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drives the session to completion.
    pub async fn run(mut self) {
        let result = self.drive().await;
        self.teardown(result).await;
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let login_done = CancellationToken::new();
        let _stop_timer = login_done.clone().drop_guard();
        self.spawn_login_timer(login_done.clone());

        let name = self.login().await?;
        login_done.cancel();
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }

        self.spawn(name).await?;
        self.active().await
    }

    fn spawn_login_timer(&self, login_done: CancellationToken) {
        let output = Arc::clone(&self.output);
        let shutdown = self.shutdown.clone();
        let timeout = self.ctx.config.login_timeout();
        let peer = self.peer;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = login_done.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!(%peer, "Login timed out");
                    let kick = ServerPacket::Kick { reason: KICK_LOGIN_TIMEOUT.to_string() };
                    if let Err(e) = output.send(&kick).await {
                        debug!(%peer, error = %e, "Failed to send login timeout kick");
                    }
                    shutdown.cancel();
                }
            }
        });
    }

    async fn read_u8(&mut self) -> Result<u8, SessionError> {
        until_closed(&self.shutdown, self.reader.read_u8()).await
    }

    async fn read_string(&mut self) -> Result<String, SessionError> {
        until_closed(&self.shutdown, read_string(&mut self.reader)).await
    }

    /// Runs the identification exchange and returns the player name.
    async fn login(&mut self) -> Result<String, SessionError> {
        self.phase = SessionPhase::AwaitingHello;
        if self.read_u8().await? != PacketId::Identification as u8 {
            return Err(kick(KICK_EXPECTED_IDENTIFICATION));
        }
        if self.read_u8().await? != PROTOCOL_VERSION {
            return Err(kick(KICK_WRONG_PROTOCOL));
        }
        let name = self.read_string().await?;
        let key = self.read_string().await?;

        self.phase = SessionPhase::Verifying;
        if self.ctx.config.verify_names && !self.ctx.verify_name(&name, &key)? {
            info!(peer = %self.peer, player = %name, "Name verification failed");
            return Err(kick(KICK_VERIFICATION_FAILED));
        }
        if !is_valid_name(&name) {
            return Err(kick(KICK_INVALID_NAME));
        }

        if self.read_u8().await? == CPE_MAGIC {
            self.negotiate().await?;
        }
        info!(peer = %self.peer, player = %name, "Player logged in");
        Ok(name)
    }

    /// Capability exchange. The server offers no extensions; the client's
    /// list is read to its announced length and discarded.
    async fn negotiate(&mut self) -> Result<(), SessionError> {
        self.phase = SessionPhase::NegotiatingCapabilities;
        self.output
            .send(&ServerPacket::ExtInfo {
                app_name: SOFTWARE_NAME.to_string(),
                extension_count: 0,
            })
            .await?;

        let (app_name, count) = match self.read_negotiation_packet(PacketId::ExtInfo).await? {
            ClientPacket::ExtInfo {
                app_name,
                extension_count,
            } => (app_name, extension_count),
            _ => return Err(kick(KICK_UNEXPECTED_NEGOTIATION)),
        };
        for _ in 0..count.max(0) {
            match self.read_negotiation_packet(PacketId::ExtEntry).await? {
                ClientPacket::ExtEntry { name, version } => {
                    debug!(peer = %self.peer, extension = %name, version, "Client extension ignored");
                }
                _ => return Err(kick(KICK_UNEXPECTED_NEGOTIATION)),
            }
        }
        debug!(peer = %self.peer, client = %app_name, offered = count, "Capability negotiation finished");
        Ok(())
    }

    async fn read_negotiation_packet(
        &mut self,
        expected: PacketId,
    ) -> Result<ClientPacket, SessionError> {
        let id = self.read_u8().await?;
        if id != expected as u8 {
            return Err(kick(KICK_UNEXPECTED_NEGOTIATION));
        }
        until_closed(&self.shutdown, ClientPacket::read_body(id, &mut self.reader)).await
    }

    /// Registers the player, sends the server identification and the
    /// default world.
    async fn spawn(&mut self, name: String) -> Result<(), SessionError> {
        self.phase = SessionPhase::Spawning;
        let rank = self.ctx.rank_for_player(&name);
        let id = self
            .ctx
            .players
            .admit(&name, Arc::clone(&self.output))
            .map_err(|e| kick(e.to_string()))?;
        let operator = rank.operator;
        self.player = Some(Player {
            id,
            name: name.clone(),
            rank,
            world: None,
            position: Position::ZERO,
            orientation: Orientation::new(0.0, 0.0),
        });

        self.output
            .send(&ServerPacket::ServerIdentification {
                protocol_version: PROTOCOL_VERSION,
                name: self.ctx.config.name.clone(),
                motd: self.ctx.config.motd.clone(),
                user_type: if operator { USER_TYPE_OP } else { USER_TYPE_NORMAL },
            })
            .await?;

        let default_world = &self.ctx.config.default_world;
        let world = self
            .ctx
            .lookup_world(default_world)
            .ok_or_else(|| kick(format!("world {default_world} is unavailable")))?;
        self.switch_world(world).await?;

        self.phase = SessionPhase::Active;
        info!(peer = %self.peer, player = %name, id, "Player spawned");
        self.ctx.players.broadcast(&ServerPacket::Message {
            player_id: SELF_ID,
            message: format!("&e{name} joined the game"),
        });
        Ok(())
    }

    /// Moves the player into `world` and waits for the transfer to finish.
    pub async fn switch_world(&mut self, world: Arc<World>) -> Result<(), SessionError> {
        let pending = self.request_switch(world);
        self.finish_switch(pending).await
    }

    /// Starts a world switch on its own task. Switches requested by one
    /// session run one after another in request order.
    fn request_switch(&mut self, world: Arc<World>) -> PendingSwitch {
        let (tx, rx) = oneshot::channel();
        let Some(player) = self.player.as_ref() else {
            let _ = tx.send(Err(SessionError::Closed));
            return rx;
        };
        let job = SwitchJob {
            ctx: Arc::clone(&self.ctx),
            output: Arc::clone(&self.output),
            player_id: player.id,
            player_name: player.name.clone(),
            rank: player.rank.clone(),
            world,
        };

        let done = CancellationToken::new();
        let previous = self.last_switch.replace(done.clone());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _done = done.drop_guard();
            if let Some(previous) = previous {
                previous.cancelled().await;
            }
            let _ = tx.send(until_closed(&shutdown, job.run()).await);
        });
        rx
    }

    async fn finish_switch(&mut self, pending: PendingSwitch) -> Result<(), SessionError> {
        let world = pending.await.map_err(|_| SessionError::Closed)??;
        if let Some(player) = self.player.as_mut() {
            player.position = world.spawn();
            player.orientation = world.spawn_orientation();
            player.world = Some(world);
        }
        Ok(())
    }

    async fn active(&mut self) -> Result<(), SessionError> {
        let mut ping = tokio::time::interval(self.ctx.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SessionError::Closed),
                _ = self.output.closed() => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client stopped reading").into());
                }
                _ = ping.tick() => self.output.send(&ServerPacket::Ping).await?,
                id = self.reader.read_u8() => {
                    let id = id?;
                    let read = ClientPacket::read_body(id, &mut self.reader);
                    let packet = match until_closed(&self.shutdown, read).await {
                        Ok(packet) => packet,
                        Err(SessionError::Protocol(
                            ProtocolError::UnknownPacket(_) | ProtocolError::WrongDirection(_),
                        )) => return Err(kick(KICK_UNEXPECTED_PACKET)),
                        Err(e) => return Err(e),
                    };
                    self.handle(packet).await?;
                }
            }
        }
    }

    async fn handle(&mut self, packet: ClientPacket) -> Result<(), SessionError> {
        match packet {
            ClientPacket::SetBlock {
                x,
                y,
                z,
                mode,
                block,
            } => self.handle_set_block([x, y, z], mode, block).await,
            ClientPacket::PositionOrientation {
                position,
                yaw,
                pitch,
                ..
            } => {
                if let Some(player) = self.player.as_mut() {
                    player.position = Position::from_fixed(position);
                    player.orientation = Orientation::from_bytes(yaw, pitch);
                }
                Ok(())
            }
            ClientPacket::Message { message, .. } => self.handle_chat(&message).await,
            _ => Err(kick(KICK_UNEXPECTED_PACKET)),
        }
    }

    async fn handle_set_block(
        &mut self,
        at: [i16; 3],
        mode: u8,
        block: u8,
    ) -> Result<(), SessionError> {
        let Some(player) = self.player.as_ref() else {
            return Err(SessionError::Closed);
        };
        let Some(world) = player.world.clone() else {
            return Ok(());
        };
        let [x, y, z] = at;
        let (Ok(ux), Ok(uy), Ok(uz)) = (usize::try_from(x), usize::try_from(y), usize::try_from(z))
        else {
            return Ok(());
        };

        let target = match mode {
            SET_BLOCK_CREATE => Some(block),
            SET_BLOCK_DESTROY => Some(Block::Air.id()),
            _ => None,
        };
        let allowed = target
            .filter(|&id| Block::from_u8(id).is_some())
            .filter(|_| player.rank.permits(world.build_permission()));

        // The grid lock may be held by a save, so stay off the runtime.
        let editing = Arc::clone(&world);
        let edit = tokio::task::spawn_blocking(move || match allowed {
            Some(target) => editing
                .set_block(ux, uy, uz, target)
                .map(|previous| previous.map(|_| Edit::Applied(target))),
            None => editing
                .block(ux, uy, uz)
                .map(|current| current.map(|current| Edit::Refused { current })),
        })
        .await
        .map_err(io::Error::other)??;

        match edit {
            None => {
                debug!(player = %player.name, ?at, "Block edit out of bounds");
            }
            Some(Edit::Refused { current }) => {
                debug!(player = %player.name, ?at, mode, block, "Block edit refused");
                self.output
                    .send(&ServerPacket::SetBlock {
                        x,
                        y,
                        z,
                        block: current,
                    })
                    .await?;
            }
            Some(Edit::Applied(target)) => {
                self.ctx.players.broadcast_world(
                    world.name(),
                    player.id,
                    &ServerPacket::SetBlock {
                        x,
                        y,
                        z,
                        block: target,
                    },
                );
            }
        }
        Ok(())
    }

    async fn handle_chat(&mut self, message: &str) -> Result<(), SessionError> {
        let Some(player) = self.player.as_ref() else {
            return Err(SessionError::Closed);
        };
        info!(player = %player.name, %message, "Chat");
        let line = format!("&{}{}: &f{}", player.rank.color, player.name, message);
        self.ctx.players.broadcast(&ServerPacket::Message {
            player_id: player.id,
            message: line,
        });
        Ok(())
    }

    async fn teardown(&mut self, result: Result<(), SessionError>) {
        let peer = self.peer;
        match result {
            Ok(()) | Err(SessionError::Closed) => info!(%peer, "Session closed"),
            Err(SessionError::Kick(reason)) => {
                info!(%peer, %reason, "Kicking client");
                let packet = ServerPacket::Kick { reason };
                if let Err(e) = self.output.send(&packet).await {
                    debug!(%peer, error = %e, "Failed to send kick");
                }
            }
            Err(SessionError::Io(e)) | Err(SessionError::Protocol(ProtocolError::Io(e))) => {
                info!(%peer, error = %e, "Client disconnected");
            }
            Err(e) => warn!(%peer, error = %e, "Session failed"),
        }

        self.phase = SessionPhase::Closed;
        self.shutdown.cancel();
        self.output.close(CLOSE_GRACE).await;

        if let Some(player) = self.player.take() {
            self.ctx.players.remove(player.id);
            self.ctx.players.broadcast(&ServerPacket::Message {
                player_id: SELF_ID,
                message: format!("&e{} left the game", player.name),
            });
        }
    }
}
