//! Transport acceptors for inbound tunnel clients.
//!
//! Each acceptor owns a bound endpoint, admits at most `max_clients` live
//! clients, and yields them one at a time through [`Acceptor::accept`].
//! Clients that arrive while the ceiling is reached are rejected: TCP
//! connections are closed right after accept, first datagrams from new UDP
//! peers are dropped. Neither stalls the listener.
//!
//! Acceptors are one-shot: once stopped they refuse to listen again.

pub mod tcp;
pub mod udp;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub use tcp::{TcpAcceptor, TcpClient};
pub use udp::{UdpAcceptor, UdpClient};

/// Maximum size of a relayed UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A listening endpoint that yields accepted clients.
pub trait Acceptor: Send + Sync + 'static {
    type Client: Send + 'static;

    fn protocol(&self) -> Protocol;

    fn is_running(&self) -> bool;

    /// Wait for the next client.
    ///
    /// Returns `None` once the acceptor is stopped or its socket has failed.
    fn accept(&self) -> impl Future<Output = Option<Self::Client>> + Send;
}

/// Ceiling on concurrently live clients.
///
/// Every accepted client carries a [`ClientSlot`]; dropping the client frees it.
#[derive(Clone)]
pub(crate) struct ClientSlots {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// Capacity held by one live client.
pub(crate) struct ClientSlot {
    _permit: OwnedSemaphorePermit,
}

impl ClientSlots {
    pub(crate) fn new(max: usize) -> Self {
        let max = max.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub(crate) fn try_acquire(&self) -> Option<ClientSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ClientSlot { _permit: permit })
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn in_use(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_enforce_ceiling_and_release_on_drop() {
        let slots = ClientSlots::new(2);

        let a = slots.try_acquire().unwrap();
        let _b = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.in_use(), 2);

        drop(a);

        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn slots_clamp_zero_to_one() {
        let slots = ClientSlots::new(0);

        assert_eq!(slots.max(), 1);
    }

    #[test]
    fn protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }
}
