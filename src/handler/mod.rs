//! Tunnel handlers.
//!
//! A [`TunnelHandler`] takes ownership of an accepted client, negotiates the
//! tunnel and relays traffic until the client closes or cancellation fires.
//! The relay server only depends on this trait, so other tunnel protocols can
//! be plugged in without touching it.

mod address;
mod plain;

pub use address::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, TargetAddr};
pub use plain::PlainTunnelHandler;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::transport::{TcpClient, UdpClient};

/// Protocol-specific handshake and relay for accepted clients.
///
/// Implementations must close every client they receive, stop promptly once
/// `cancel` fires, and contain per-client errors instead of returning them.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn handle_tcp(&self, client: TcpClient, cancel: CancellationToken);

    async fn handle_udp(&self, client: UdpClient, cancel: CancellationToken);

    /// Release handler-held resources and abort relays still in flight.
    fn dispose(&self);
}
