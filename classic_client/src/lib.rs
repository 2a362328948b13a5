//! `classic_client`
//!
//! Client-side systems:
//! - Login handshake, with optional capability negotiation
//! - Level download and decompression
//! - Chat, movement and block edit sends
//!
//! Used by the integration tests and as a manual test client against a server.

pub mod client;

pub use client::{GameClient, Kicked, Level, LoginOptions};
