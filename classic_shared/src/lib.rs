//! `classic_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Byte-exact wire codec for protocol version 7.
//! - Clear separation of concerns (net, block ids, math, config, ranks).
//! - No `unsafe`.

pub mod block;
pub mod config;
pub mod math;
pub mod net;
pub mod rank;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::block::*;
    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::rank::*;
}
