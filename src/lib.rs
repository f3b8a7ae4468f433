//! ssrelay - server-side relay endpoint for SOCKS5-style tunnels.
//!
//! Accepts TCP and UDP tunnel clients, hands each to a pluggable tunnel
//! handler, and resolves remote host names through a caching resolver.

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod resolver;
pub mod server;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
