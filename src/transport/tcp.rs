//! TCP acceptor for tunnel clients.
//!
//! Binds a listener and hands out one connection per `accept` call.
//! Connections over the client ceiling are closed immediately.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acceptor, ClientSlot, ClientSlots, Protocol};
use crate::error::{Error, Result};

/// An accepted TCP peer.
///
/// Holds one client slot until dropped.
pub struct TcpClient {
    stream: TcpStream,
    peer_addr: SocketAddr,
    _slot: ClientSlot,
}

impl TcpClient {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Close the connection and release its slot.
    pub fn close(self) {
        debug!(peer = %self.peer_addr, "closing TCP client");
    }
}

/// TCP acceptor.
pub struct TcpAcceptor {
    bind_addr: SocketAddr,
    slots: ClientSlots,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl TcpAcceptor {
    pub fn new(bind_addr: SocketAddr, max_clients: usize) -> Self {
        Self {
            bind_addr,
            slots: ClientSlots::new(max_clients),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the listener. A no-op if already listening.
    pub async fn listen(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::AcceptorStopped(Protocol::Tcp.as_str()));
        }
        if self.is_running() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(Arc::new(listener));
        }
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(local_addr);
        }
        self.running.store(true, Ordering::SeqCst);

        info!(
            addr = %local_addr,
            max_clients = self.slots.max(),
            "TCP acceptor listening"
        );
        Ok(())
    }

    /// Release the listener and wake any pending `accept`.
    pub fn stop_listen(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.shutdown.cancel();

        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
        if was_running {
            info!(addr = %self.bind_addr, "TCP acceptor stopped");
        }
    }

    /// Address actually bound, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Clients currently holding a slot.
    pub fn active_clients(&self) -> usize {
        self.slots.in_use()
    }

    fn current_listener(&self) -> Option<Arc<TcpListener>> {
        self.listener.lock().ok().and_then(|slot| slot.clone())
    }

    fn fail(&self, err: &io::Error) {
        warn!(addr = %self.bind_addr, "TCP listener failed: {}", err);
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
    }
}

impl Acceptor for TcpAcceptor {
    type Client = TcpClient;

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn accept(&self) -> Option<TcpClient> {
        loop {
            let listener = self.current_listener()?;

            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        debug!("TCP accept error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        self.fail(&e);
                        return None;
                    }
                },
            };

            let Some(slot) = self.slots.try_acquire() else {
                warn!(
                    peer = %peer_addr,
                    max_clients = self.slots.max(),
                    "TCP client rejected: client limit reached"
                );
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, "set_nodelay failed: {}", e);
            }

            return Some(TcpClient {
                stream,
                peer_addr,
                _slot: slot,
            });
        }
    }
}

/// Errors that affect a single pending connection rather than the listener.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || err.raw_os_error().is_some_and(is_fd_exhaustion)
}

/// EMFILE / ENFILE: out of descriptors, clears once clients close.
fn is_fd_exhaustion(code: i32) -> bool {
    code == 23 || code == 24
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn listening(max_clients: usize) -> Arc<TcpAcceptor> {
        let acceptor = Arc::new(TcpAcceptor::new(loopback(), max_clients));
        acceptor.listen().await.unwrap();
        acceptor
    }

    #[tokio::test]
    async fn accept_yields_connected_client() {
        let acceptor = listening(4).await;
        let addr = acceptor.local_addr().unwrap();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut client = acceptor.accept().await.unwrap();
        conn.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        client.stream().read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"ping");
        assert_eq!(client.peer_addr(), conn.local_addr().unwrap());
        assert_eq!(acceptor.active_clients(), 1);
    }

    #[tokio::test]
    async fn stop_listen_unblocks_pending_accept() {
        let acceptor = listening(4).await;
        let pending = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { acceptor.accept().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        acceptor.stop_listen();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept did not return after stop")
            .unwrap();

        assert!(result.is_none());
        assert!(!acceptor.is_running());
    }

    #[tokio::test]
    async fn listen_after_stop_is_refused() {
        let acceptor = listening(4).await;

        acceptor.stop_listen();

        assert!(matches!(
            acceptor.listen().await,
            Err(Error::AcceptorStopped(_))
        ));
    }

    #[tokio::test]
    async fn over_ceiling_connections_are_closed() {
        let acceptor = listening(1).await;
        let addr = acceptor.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let held = acceptor.accept().await.unwrap();

        let mut rejected = TcpStream::connect(addr).await.unwrap();
        let next = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { acceptor.accept().await }
        });

        // The rejected connection is closed by the acceptor
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), rejected.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        // Freeing the slot lets the next connection through
        drop(held);
        let mut third = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"x").await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(1), next)
            .await
            .unwrap()
            .unwrap();
        assert!(accepted.is_some());
    }

    #[tokio::test]
    async fn stop_listen_before_listen_is_harmless() {
        let acceptor = TcpAcceptor::new(loopback(), 4);

        acceptor.stop_listen();
        acceptor.stop_listen();

        assert!(!acceptor.is_running());
        assert!(acceptor.accept().await.is_none());
    }

    #[test]
    fn transient_errors_keep_listener_alive() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
