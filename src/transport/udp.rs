//! UDP acceptor for tunnel clients.
//!
//! UDP has no connections, so a peer is identified by its source
//! `(address, port)`. The first datagram from an unseen peer creates a
//! [`UdpClient`]; later datagrams from that peer are queued to it. A session
//! ends when its client is dropped, which handlers do after the client has
//! been idle for the configured timeout.
//!
//! Clients reach the socket through a slot owned by the acceptor, so
//! `stop_listen` releases the port even while clients are still alive.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Acceptor, ClientSlot, ClientSlots, MAX_DATAGRAM_SIZE, Protocol};
use crate::error::{Error, Result};

/// Datagrams buffered per peer before new ones are dropped.
const SESSION_QUEUE_DEPTH: usize = 128;

type Sessions = Arc<Mutex<FxHashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// Listening socket, emptied by `stop_listen`.
type SocketSlot = Arc<Mutex<Option<Arc<UdpSocket>>>>;

/// A UDP peer session.
pub struct UdpClient {
    peer_addr: SocketAddr,
    socket: SocketSlot,
    datagrams: mpsc::Receiver<Vec<u8>>,
    idle_timeout: Duration,
    sessions: Sessions,
    _slot: ClientSlot,
}

impl UdpClient {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Next datagram from the peer.
    ///
    /// Returns `None` after the idle timeout or once the acceptor stops.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        tokio::time::timeout(self.idle_timeout, self.datagrams.recv())
            .await
            .ok()
            .flatten()
    }

    /// Send a datagram to the peer from the listening socket.
    ///
    /// Fails with `NotConnected` once the acceptor has stopped.
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        let socket = self.socket.lock().ok().and_then(|slot| slot.clone());
        let Some(socket) = socket else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "UDP acceptor stopped",
            ));
        };
        socket.send_to(data, self.peer_addr).await
    }

    /// End the session and release its slot.
    pub fn close(self) {
        debug!(peer = %self.peer_addr, "closing UDP client");
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.datagrams.close();
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        // A newer session for the same peer may already own the entry
        if sessions
            .get(&self.peer_addr)
            .is_some_and(|tx| tx.is_closed())
        {
            sessions.remove(&self.peer_addr);
        }
    }
}

struct Listening {
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<UdpClient>>>,
    socket: SocketSlot,
    sessions: Sessions,
    receiver: JoinHandle<()>,
}

/// UDP acceptor.
pub struct UdpAcceptor {
    bind_addr: SocketAddr,
    slots: ClientSlots,
    idle_timeout: Duration,
    state: Mutex<Option<Listening>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl UdpAcceptor {
    pub fn new(bind_addr: SocketAddr, max_clients: usize, idle_timeout: Duration) -> Self {
        Self {
            bind_addr,
            slots: ClientSlots::new(max_clients),
            idle_timeout,
            state: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the socket and start routing datagrams. A no-op if already listening.
    pub async fn listen(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::AcceptorStopped(Protocol::Udp.as_str()));
        }
        if self.is_running() {
            return Ok(());
        }

        let socket = Arc::new(UdpSocket::bind(self.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let slot: SocketSlot = Arc::new(Mutex::new(Some(socket.clone())));
        let sessions: Sessions = Arc::new(Mutex::new(FxHashMap::default()));
        let (incoming_tx, incoming_rx) = mpsc::channel(self.slots.max());

        let router = Router {
            socket,
            slot: slot.clone(),
            sessions: sessions.clone(),
            incoming: incoming_tx,
            slots: self.slots.clone(),
            idle_timeout: self.idle_timeout,
            shutdown: self.shutdown.clone(),
            running: self.running.clone(),
        };

        self.running.store(true, Ordering::SeqCst);
        let receiver = tokio::spawn(router.run());

        if let Ok(mut state) = self.state.lock() {
            *state = Some(Listening {
                incoming: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
                socket: slot,
                sessions,
                receiver,
            });
        }
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(local_addr);
        }

        info!(
            addr = %local_addr,
            max_clients = self.slots.max(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "UDP acceptor listening"
        );
        Ok(())
    }

    /// Stop routing, end every session and wake any pending `accept`.
    pub fn stop_listen(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let listening = self.state.lock().ok().and_then(|mut state| state.take());
        if let Some(listening) = listening {
            listening.receiver.abort();
            if let Ok(mut socket) = listening.socket.lock() {
                socket.take();
            }
            if let Ok(mut sessions) = listening.sessions.lock() {
                sessions.clear();
            }
        }
        if was_running {
            info!(addr = %self.bind_addr, "UDP acceptor stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Peer sessions currently holding a slot.
    pub fn active_clients(&self) -> usize {
        self.slots.in_use()
    }
}

impl Acceptor for UdpAcceptor {
    type Client = UdpClient;

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn accept(&self) -> Option<UdpClient> {
        let incoming = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.as_ref().map(|l| l.incoming.clone()))?;
        let mut incoming = incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            client = incoming.recv() => {
                if client.is_none() {
                    self.running.store(false, Ordering::SeqCst);
                }
                client
            }
        }
    }
}

/// Receive loop state: reads the shared socket and routes datagrams to sessions.
struct Router {
    socket: Arc<UdpSocket>,
    slot: SocketSlot,
    sessions: Sessions,
    incoming: mpsc::Sender<UdpClient>,
    slots: ClientSlots,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
}

impl Router {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, peer) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => {
                        debug!("UDP recv error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("UDP socket failed: {}", e);
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                },
            };

            if let Some(client) = self.route(peer, buf[..len].to_vec()) {
                if self.incoming.try_send(client).is_err() {
                    debug!(peer = %peer, "UDP client dropped: accept queue unavailable");
                }
            }
        }
    }

    /// Queue a datagram to its peer session, creating the session if new.
    fn route(&self, peer: SocketAddr, datagram: Vec<u8>) -> Option<UdpClient> {
        let mut sessions = self.sessions.lock().ok()?;

        let mut datagram = datagram;
        if let Some(tx) = sessions.get(&peer) {
            match tx.try_send(datagram) {
                Ok(()) => return None,
                Err(TrySendError::Full(_)) => {
                    debug!(peer = %peer, "UDP session queue full, dropping datagram");
                    return None;
                }
                Err(TrySendError::Closed(returned)) => datagram = returned,
            }
            sessions.remove(&peer);
        }

        let Some(slot) = self.slots.try_acquire() else {
            warn!(
                peer = %peer,
                max_clients = self.slots.max(),
                "UDP client rejected: client limit reached"
            );
            return None;
        };

        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        // Fresh channel, cannot be full
        let _ = tx.try_send(datagram);
        sessions.insert(peer, tx);

        Some(UdpClient {
            peer_addr: peer,
            socket: self.slot.clone(),
            datagrams: rx,
            idle_timeout: self.idle_timeout,
            sessions: self.sessions.clone(),
            _slot: slot,
        })
    }
}

/// Errors caused by one peer (e.g. ICMP unreachable) rather than the socket.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(5);

    async fn listening(max_clients: usize, idle: Duration) -> Arc<UdpAcceptor> {
        let acceptor = Arc::new(UdpAcceptor::new(
            "127.0.0.1:0".parse().unwrap(),
            max_clients,
            idle,
        ));
        acceptor.listen().await.unwrap();
        acceptor
    }

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    /// The router task lets go of the socket once its abort is processed.
    async fn rebind_within(addr: SocketAddr) -> Option<UdpSocket> {
        for _ in 0..50 {
            if let Ok(socket) = UdpSocket::bind(addr).await {
                return Some(socket);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    async fn accept_within(acceptor: &UdpAcceptor) -> Option<UdpClient> {
        tokio::time::timeout(Duration::from_secs(1), acceptor.accept())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn first_datagram_creates_client() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;

        peer.send_to(b"hello", addr).await.unwrap();
        let mut client = accept_within(&acceptor).await.unwrap();

        assert_eq!(client.peer_addr(), peer.local_addr().unwrap());
        assert_eq!(client.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn same_peer_datagrams_route_to_one_client() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;

        peer.send_to(b"one", addr).await.unwrap();
        let mut client = accept_within(&acceptor).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"one");

        peer.send_to(b"two", addr).await.unwrap();

        assert_eq!(client.recv().await.unwrap(), b"two");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), acceptor.accept())
                .await
                .is_err()
        );
        assert_eq!(acceptor.active_clients(), 1);
    }

    #[tokio::test]
    async fn distinct_ports_are_distinct_clients() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let a = peer().await;
        let b = peer().await;

        a.send_to(b"a", addr).await.unwrap();
        let first = accept_within(&acceptor).await.unwrap();
        b.send_to(b"b", addr).await.unwrap();
        let second = accept_within(&acceptor).await.unwrap();

        assert_ne!(first.peer_addr(), second.peer_addr());
        assert_eq!(acceptor.active_clients(), 2);
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;

        peer.send_to(b"ping", addr).await.unwrap();
        let client = accept_within(&acceptor).await.unwrap();
        client.send(b"pong").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, addr);
    }

    #[tokio::test]
    async fn new_peers_over_ceiling_are_dropped_until_slot_frees() {
        let acceptor = listening(1, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let a = peer().await;
        let b = peer().await;

        a.send_to(b"a", addr).await.unwrap();
        let held = accept_within(&acceptor).await.unwrap();

        b.send_to(b"dropped", addr).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), acceptor.accept())
                .await
                .is_err()
        );

        drop(held);
        b.send_to(b"admitted", addr).await.unwrap();
        let mut client = accept_within(&acceptor).await.unwrap();

        assert_eq!(client.peer_addr(), b.local_addr().unwrap());
        assert_eq!(client.recv().await.unwrap(), b"admitted");
    }

    #[tokio::test]
    async fn dropped_session_is_recreated_on_next_datagram() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;

        peer.send_to(b"first", addr).await.unwrap();
        accept_within(&acceptor).await.unwrap().close();
        peer.send_to(b"again", addr).await.unwrap();
        let mut client = accept_within(&acceptor).await.unwrap();

        assert_eq!(client.recv().await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn recv_returns_none_when_idle() {
        let acceptor = listening(4, Duration::from_millis(50)).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;

        peer.send_to(b"x", addr).await.unwrap();
        let mut client = accept_within(&acceptor).await.unwrap();
        client.recv().await.unwrap();

        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_listen_unblocks_accept_and_ends_sessions() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;
        peer.send_to(b"x", addr).await.unwrap();
        let mut client = accept_within(&acceptor).await.unwrap();
        client.recv().await.unwrap();

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
        assert!(client.recv().await.is_none());
        assert!(!acceptor.is_running());
        assert!(matches!(
            acceptor.listen().await,
            Err(Error::AcceptorStopped(_))
        ));
    }

    #[tokio::test]
    async fn stop_listen_releases_port_while_client_alive() {
        let acceptor = listening(4, IDLE).await;
        let addr = acceptor.local_addr().unwrap();
        let peer = peer().await;
        peer.send_to(b"x", addr).await.unwrap();
        let client = accept_within(&acceptor).await.unwrap();

        acceptor.stop_listen();

        assert!(rebind_within(addr).await.is_some());
        let err = client.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
