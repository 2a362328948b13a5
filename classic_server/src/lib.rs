//! `classic_server`
//!
//! Server-side systems:
//! - Lifecycle state machine, listener and accept loop ([`server`])
//! - Per-connection login and play state machine ([`session`])
//! - Worlds, their storage format and load/unload state machine ([`world`])
//! - Pluggable world generation ([`worldgen`])
//! - Name verification ([`auth`]), ranks and the player roster
//!
//! Networking model: one TCP connection per player, one task per
//! connection, all outbound packets serialized through a bounded
//! per-connection queue drained by its own writer task.

pub mod auth;
pub mod players;
pub mod ranks;
pub mod server;
pub mod session;
pub mod world;
pub mod worldgen;

pub use server::{GameServer, ServerContext, ServerError, ServerState};
