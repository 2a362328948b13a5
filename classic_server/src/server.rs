//! Server core.
//!
//! [`GameServer`] owns the lifecycle state machine, the listening socket and
//! the per-run salt. Everything sessions need lives in the shared
//! [`ServerContext`], which is built once and handed to every session.
//!
//! Lifecycle:
//! - `start`: Stopped -> Starting -> Started, rolled back to Stopped on failure
//! - `stop`: Started -> Stopping -> Stopped
//!
//! Any other call fails with [`ServerError::InvalidTransition`] and leaves the
//! state alone.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use classic_shared::config::ServerConfig;
use classic_shared::net::ServerPacket;
use classic_shared::rank::Rank;
use rand::Rng;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Salt;
use crate::players::PlayerList;
use crate::ranks::RankRegistry;
use crate::session::Session;
use crate::world::grid::Dimensions;
use crate::world::registry::{DuplicateWorld, WorldRegistry};
use crate::world::store::{FormatRegistry, StoreError};
use crate::world::{World, WorldError, WorldLoadState};
use crate::worldgen::GeneratorRegistry;

/// Generator used for a missing default world.
pub const DEFAULT_GENERATOR: &str = "flatgrass";

/// Extent of each axis of a generated default world.
pub const DEFAULT_WORLD_EXTENT: i64 = 128;

pub const KICK_SERVER_STOPPING: &str = "the server is stopping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Started => "started",
            ServerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The call is not allowed in the current state. Indicates a caller bug.
    #[error("cannot {op} while the server is {state}")]
    InvalidTransition {
        op: &'static str,
        state: ServerState,
    },
    #[error("the server is not started")]
    NotStarted,
    #[error("invalid listen address {addr:?}: {source}")]
    Addr {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("failed to scan worlds directory {}: {source}", path.display())]
    Discover { path: PathBuf, source: io::Error },
    #[error("no world generator named {0:?}")]
    UnknownGenerator(String),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    DuplicateWorld(#[from] DuplicateWorld),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServerError {
    /// Whether this error comes from misuse rather than the environment.
    pub fn is_logic_error(&self) -> bool {
        match self {
            ServerError::InvalidTransition { .. } | ServerError::NotStarted => true,
            ServerError::World(e) => e.is_logic_error(),
            _ => false,
        }
    }
}

struct BackgroundTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BackgroundTask {
    async fn shut_down(self, what: &str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(task = what, error = %e, "Background task ended abnormally");
        }
    }
}

struct Lifecycle {
    state: ServerState,
    salt: Option<Salt>,
    local_addr: Option<SocketAddr>,
    listener: Option<BackgroundTask>,
    autosave: Option<BackgroundTask>,
    /// Parent of every session's shutdown token for the current run.
    sessions: Option<CancellationToken>,
}

/// Registries and settings shared by the server and all sessions.
pub struct ServerContext {
    pub config: ServerConfig,
    pub worlds: WorldRegistry,
    pub ranks: RankRegistry,
    pub players: PlayerList,
    pub generators: GeneratorRegistry,
    pub formats: FormatRegistry,
    lifecycle: Mutex<Lifecycle>,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        generators: GeneratorRegistry,
        formats: FormatRegistry,
    ) -> Self {
        let players = PlayerList::new(config.max_players);
        Self {
            config,
            worlds: WorldRegistry::new(),
            ranks: RankRegistry::new(),
            players,
            generators,
            formats,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                salt: None,
                local_addr: None,
                listener: None,
                autosave: None,
                sessions: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn lookup_world(&self, name: &str) -> Option<Arc<World>> {
        self.worlds.get(name)
    }

    pub fn lookup_rank(&self, name: &str) -> Option<Rank> {
        self.ranks.get(name)
    }

    /// The configured rank of a player, or the default rank.
    pub fn rank_for_player(&self, player: &str) -> Rank {
        self.config
            .player_ranks
            .get(player)
            .and_then(|rank| self.ranks.get(rank))
            .unwrap_or_else(|| self.ranks.ensure(&self.config.default_rank).0)
    }

    /// Checks `key` against the digest of this run's salt and `name`.
    /// Valid only while started.
    pub fn verify_name(&self, name: &str, key: &str) -> Result<bool, ServerError> {
        let lifecycle = self.lock();
        match (&lifecycle.state, &lifecycle.salt) {
            (ServerState::Started, Some(salt)) => Ok(salt.verify(name, key)),
            _ => Err(ServerError::NotStarted),
        }
    }

    /// A token cancelled when the current run stops.
    pub(crate) fn session_token(&self) -> CancellationToken {
        match &self.lock().sessions {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        }
    }

    /// Saves every loaded world, logging failures. Returns how many were saved.
    pub fn save_loaded_worlds(&self) -> usize {
        let mut saved = 0;
        for world in self.worlds.loaded() {
            match world.save() {
                Ok(()) => saved += 1,
                Err(e) => warn!(world = %world.name(), error = %e, "World save failed"),
            }
        }
        saved
    }
}

#[derive(Clone)]
pub struct GameServer {
    ctx: Arc<ServerContext>,
}

impl GameServer {
    /// A stopped server with the built-in generators and world formats.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registries(
            config,
            GeneratorRegistry::with_defaults(),
            FormatRegistry::with_defaults(),
        )
    }

    pub fn with_registries(
        config: ServerConfig,
        generators: GeneratorRegistry,
        formats: FormatRegistry,
    ) -> Self {
        Self {
            ctx: Arc::new(ServerContext::new(config, generators, formats)),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn state(&self) -> ServerState {
        self.ctx.state()
    }

    /// Bound listener address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.lock().local_addr
    }

    /// This run's salt while started.
    pub fn salt(&self) -> Option<Salt> {
        self.ctx.lock().salt.clone()
    }

    pub fn lookup_world(&self, name: &str) -> Option<Arc<World>> {
        self.ctx.lookup_world(name)
    }

    pub fn lookup_rank(&self, name: &str) -> Option<Rank> {
        self.ctx.lookup_rank(name)
    }

    pub fn verify_name(&self, name: &str, key: &str) -> Result<bool, ServerError> {
        self.ctx.verify_name(name, key)
    }

    pub fn players(&self) -> &PlayerList {
        &self.ctx.players
    }

    /// Saves every loaded world off the async runtime.
    pub async fn save_all(&self) -> Result<usize, ServerError> {
        let ctx = Arc::clone(&self.ctx);
        Ok(tokio::task::spawn_blocking(move || ctx.save_loaded_worlds()).await?)
    }

    /// Prepares worlds and ranks, binds the listener and starts accepting.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut lifecycle = self.ctx.lock();
            if lifecycle.state != ServerState::Stopped {
                return Err(ServerError::InvalidTransition {
                    op: "start",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = ServerState::Starting;
        }
        info!("Server starting");

        match self.bring_up().await {
            Ok(listener) => {
                let addr = listener.local_addr().ok();
                let mut lifecycle = self.ctx.lock();
                let close = CancellationToken::new();
                lifecycle.listener = Some(BackgroundTask {
                    cancel: close.clone(),
                    task: tokio::spawn(accept_loop(Arc::clone(&self.ctx), listener, close)),
                });
                lifecycle.autosave = self.ctx.config.save_interval().map(|period| {
                    let cancel = CancellationToken::new();
                    BackgroundTask {
                        cancel: cancel.clone(),
                        task: tokio::spawn(autosave_loop(Arc::clone(&self.ctx), period, cancel)),
                    }
                });
                lifecycle.sessions = Some(CancellationToken::new());
                lifecycle.salt = Some(Salt::generate());
                lifecycle.local_addr = addr;
                lifecycle.state = ServerState::Started;
                drop(lifecycle);
                info!(addr = ?addr, "Server started");
                Ok(())
            }
            Err(e) => {
                self.ctx.lock().state = ServerState::Stopped;
                error!(error = %e, "Server start failed");
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<TcpListener, ServerError> {
        let config = &self.ctx.config;

        let ctx = Arc::clone(&self.ctx);
        let dir = config.worlds_dir.clone();
        tokio::task::spawn_blocking(move || ctx.worlds.discover(&ctx.config.worlds_dir, &ctx.formats))
            .await?
            .map_err(|source| ServerError::Discover { path: dir, source })?;

        self.ensure_default_world().await?;

        for rank in &config.ranks {
            self.ctx.ranks.insert(rank.clone());
        }
        let (rank, created) = self.ctx.ranks.ensure(&config.default_rank);
        if created {
            info!(rank = %rank.name, "Created default rank");
        }

        bind_listener(config)
    }

    async fn ensure_default_world(&self) -> Result<(), ServerError> {
        let name = self.ctx.config.default_world.clone();
        let ctx = Arc::clone(&self.ctx);

        let world = match ctx.worlds.get(&name) {
            Some(world) => world,
            None => {
                let path = ctx.config.world_path(&name);
                if path.exists() {
                    // Discovery skipped it; surface the reason instead of overwriting.
                    let formats = self.ctx.formats.clone();
                    tokio::task::spawn_blocking(move || World::open(&path, &formats)).await??;
                    return Err(WorldError::Store(StoreError::Corrupt(format!(
                        "world file for {name:?} holds a different name"
                    )))
                    .into());
                }
                let generator = ctx
                    .generators
                    .get(DEFAULT_GENERATOR)
                    .ok_or_else(|| ServerError::UnknownGenerator(DEFAULT_GENERATOR.to_string()))?;
                let dims = Dimensions::new(
                    DEFAULT_WORLD_EXTENT,
                    DEFAULT_WORLD_EXTENT,
                    DEFAULT_WORLD_EXTENT,
                )
                .map_err(WorldError::from)?;
                let seed: i64 = rand::thread_rng().gen();
                info!(world = %name, seed, "Generating default world");
                let world = tokio::task::spawn_blocking(move || {
                    let world = World::generate(&name, dims, path, &*generator, seed);
                    world.save().map(|()| world)
                })
                .await??;
                self.ctx.worlds.insert(world)?
            }
        };

        if world.state() == WorldLoadState::Unloaded {
            let formats = self.ctx.formats.clone();
            let loading = Arc::clone(&world);
            tokio::task::spawn_blocking(move || loading.load(&formats)).await??;
        }
        Ok(())
    }

    /// Stops accepting, disconnects players and saves loaded worlds.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let (listener, autosave, sessions) = {
            let mut lifecycle = self.ctx.lock();
            if lifecycle.state != ServerState::Started {
                return Err(ServerError::InvalidTransition {
                    op: "stop",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = ServerState::Stopping;
            lifecycle.salt = None;
            lifecycle.local_addr = None;
            (
                lifecycle.listener.take(),
                lifecycle.autosave.take(),
                lifecycle.sessions.take(),
            )
        };
        info!("Server stopping");

        if let Some(listener) = listener {
            listener.shut_down("accept").await;
        }
        if let Some(autosave) = autosave {
            autosave.shut_down("autosave").await;
        }

        // Queued before cancelling, so each session flushes it while closing.
        self.ctx.players.broadcast(&ServerPacket::Kick {
            reason: KICK_SERVER_STOPPING.to_string(),
        });
        if let Some(sessions) = sessions {
            sessions.cancel();
        }

        match self.save_all().await {
            Ok(saved) => info!(saved, "Saved loaded worlds"),
            Err(e) => warn!(error = %e, "Shutdown save failed"),
        }

        self.ctx.lock().state = ServerState::Stopped;
        info!("Server stopped");
        Ok(())
    }
}

fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let text = config.listen_addr();
    let addr: SocketAddr = text.parse().map_err(|source| ServerError::Addr {
        addr: text.clone(),
        source,
    })?;
    let bind = || -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(config.backlog)
    };
    let listener = bind().map_err(|source| ServerError::Bind { addr, source })?;
    info!(addr = %addr, backlog = config.backlog, "Listening");
    Ok(listener)
}

async fn accept_loop(ctx: Arc<ServerContext>, listener: TcpListener, close: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                info!(%peer, "Connection accepted");
                if let Err(e) = stream.set_nodelay(ctx.config.tcp_no_delay) {
                    debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let (reader, writer) = stream.into_split();
                let session = Session::new(Arc::clone(&ctx), peer, BufReader::new(reader), writer);
                tokio::spawn(session.run());
            }
            Err(e) if ctx.state() == ServerState::Stopping => {
                debug!(error = %e, "Accept interrupted by shutdown");
                break;
            }
            Err(e) => {
                error!(error = %e, "Accept loop failed, no longer accepting connections");
                break;
            }
        }
    }
    debug!("Accept loop exited");
}

async fn autosave_loop(ctx: Arc<ServerContext>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let ctx = Arc::clone(&ctx);
                match tokio::task::spawn_blocking(move || ctx.save_loaded_worlds()).await {
                    Ok(saved) => debug!(saved, "Autosave finished"),
                    Err(e) => warn!(error = %e, "Autosave task failed"),
                }
            }
        }
    }
}
