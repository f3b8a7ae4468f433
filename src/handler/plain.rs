//! Plain tunnel handler: address-framed relay without a cipher.
//!
//! TCP clients send one target address header followed by the stream to
//! relay. UDP clients prefix every datagram with the target address header;
//! replies come back prefixed with the responder's address.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{TargetAddr, TunnelHandler};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::resolver::DnsResolver;
use crate::transport::{MAX_DATAGRAM_SIZE, TcpClient, UdpClient};

pub struct PlainTunnelHandler {
    resolver: Arc<DnsResolver>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
    disposed: CancellationToken,
}

impl PlainTunnelHandler {
    pub fn new(config: &RemoteConfig, resolver: Arc<DnsResolver>) -> Self {
        Self {
            resolver,
            handshake_timeout: config.handshake_timeout(),
            connect_timeout: config.connect_timeout(),
            disposed: CancellationToken::new(),
        }
    }

    async fn resolve(&self, target: &TargetAddr) -> Result<SocketAddr> {
        match target {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(host, port) => self
                .resolver
                .resolve_host(host)
                .await
                .and_then(|addrs| addrs.first().copied())
                .map(|ip| SocketAddr::new(ip, *port))
                .ok_or_else(|| Error::Unresolved(host.clone())),
        }
    }

    /// Returns bytes copied client-to-target and target-to-client.
    async fn relay_tcp(&self, client: &mut TcpClient) -> Result<(u64, u64)> {
        let target = tokio::time::timeout(
            self.handshake_timeout,
            TargetAddr::read_from(client.stream()),
        )
        .await
        .map_err(|_| Error::Timeout("handshake"))??;

        let addr = self.resolve(&target).await?;
        let mut upstream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("connect"))??;
        let _ = upstream.set_nodelay(true);

        debug!(peer = %client.peer_addr(), target = %target, "TCP relay established");
        let copied = tokio::io::copy_bidirectional(client.stream(), &mut upstream).await?;
        Ok(copied)
    }

    async fn relay_udp(&self, client: &mut UdpClient) -> Result<()> {
        let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let v6 = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await.ok();
        let mut buf4 = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut buf6 = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                datagram = client.recv() => {
                    // Idle timeout or acceptor stopped
                    let Some(datagram) = datagram else { return Ok(()) };
                    if let Err(e) = self.forward(&datagram, &v4, v6.as_ref()).await {
                        debug!(peer = %client.peer_addr(), "UDP datagram dropped: {}", e);
                    }
                }
                result = v4.recv_from(&mut buf4) => {
                    reply(client, result, &buf4).await;
                }
                result = recv_optional(v6.as_ref(), &mut buf6) => {
                    reply(client, result, &buf6).await;
                }
            }
        }
    }

    /// Send one client datagram's payload to its target.
    async fn forward(&self, datagram: &[u8], v4: &UdpSocket, v6: Option<&UdpSocket>) -> Result<()> {
        let (target, header_len) = TargetAddr::parse(datagram)?;
        let addr = self.resolve(&target).await?;
        let socket = match addr {
            SocketAddr::V4(_) => v4,
            SocketAddr::V6(_) => v6.ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "IPv6 is unavailable",
                ))
            })?,
        };
        socket.send_to(&datagram[header_len..], addr).await?;
        Ok(())
    }
}

async fn recv_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Frame a target's reply with its address and send it to the client.
async fn reply(client: &UdpClient, received: io::Result<(usize, SocketAddr)>, buf: &[u8]) {
    let (len, from) = match received {
        Ok(received) => received,
        Err(e) => {
            debug!(peer = %client.peer_addr(), "UDP upstream recv error: {}", e);
            return;
        }
    };

    let mut packet = Vec::with_capacity(len + 19);
    TargetAddr::from(from).write_to(&mut packet);
    packet.extend_from_slice(&buf[..len]);

    if let Err(e) = client.send(&packet).await {
        debug!(peer = %client.peer_addr(), "UDP reply failed: {}", e);
    }
}

#[async_trait]
impl TunnelHandler for PlainTunnelHandler {
    async fn handle_tcp(&self, mut client: TcpClient, cancel: CancellationToken) {
        let peer = client.peer_addr();

        tokio::select! {
            _ = cancel.cancelled() => debug!(peer = %peer, "TCP relay cancelled"),
            _ = self.disposed.cancelled() => debug!(peer = %peer, "TCP relay aborted: handler disposed"),
            result = self.relay_tcp(&mut client) => match result {
                Ok((up, down)) => debug!(peer = %peer, up, down, "TCP relay finished"),
                Err(e) => debug!(peer = %peer, "TCP relay failed: {}", e),
            },
        }

        client.close();
    }

    async fn handle_udp(&self, mut client: UdpClient, cancel: CancellationToken) {
        let peer = client.peer_addr();

        tokio::select! {
            _ = cancel.cancelled() => debug!(peer = %peer, "UDP relay cancelled"),
            _ = self.disposed.cancelled() => debug!(peer = %peer, "UDP relay aborted: handler disposed"),
            result = self.relay_udp(&mut client) => match result {
                Ok(()) => debug!(peer = %peer, "UDP session ended"),
                Err(e) => debug!(peer = %peer, "UDP relay failed: {}", e),
            },
        }

        client.close();
    }

    fn dispose(&self) {
        if !self.disposed.is_cancelled() {
            self.disposed.cancel();
            info!("tunnel handler disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::HostLookup;
    use crate::transport::{Acceptor, TcpAcceptor, UdpAcceptor};
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct LoopbackLookup;

    #[async_trait]
    impl HostLookup for LoopbackLookup {
        async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            if host == "echo.test" {
                Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "unknown host"))
            }
        }
    }

    fn handler() -> Arc<PlainTunnelHandler> {
        let resolver = DnsResolver::with_lookup(Arc::new(LoopbackLookup), 16, Duration::from_secs(60));
        Arc::new(PlainTunnelHandler::new(
            &RemoteConfig::default(),
            Arc::new(resolver),
        ))
    }

    async fn tcp_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn accept_tcp() -> (Arc<TcpAcceptor>, TcpStream, TcpClient) {
        let acceptor = Arc::new(TcpAcceptor::new("127.0.0.1:0".parse().unwrap(), 4));
        acceptor.listen().await.unwrap();
        let conn = TcpStream::connect(acceptor.local_addr().unwrap())
            .await
            .unwrap();
        let client = acceptor.accept().await.unwrap();
        (acceptor, conn, client)
    }

    #[tokio::test]
    async fn tcp_relays_to_resolved_domain() {
        let echo = tcp_echo_server().await;
        let handler = handler();
        let (_acceptor, mut conn, client) = accept_tcp().await;
        let relay = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle_tcp(client, CancellationToken::new()).await }
        });

        let mut request = Vec::new();
        TargetAddr::Domain("echo.test".to_string(), echo.port()).write_to(&mut request);
        request.extend_from_slice(b"hello relay");
        conn.write_all(&request).await.unwrap();

        let mut buf = [0u8; 11];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello relay");

        drop(conn);
        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn tcp_unresolved_target_closes_client() {
        let handler = handler();
        let (acceptor, mut conn, client) = accept_tcp().await;
        let mut request = Vec::new();
        TargetAddr::Domain("missing.test".to_string(), 80).write_to(&mut request);
        conn.write_all(&request).await.unwrap();

        handler.handle_tcp(client, CancellationToken::new()).await;

        let mut buf = [0u8; 1];
        assert!(matches!(conn.read(&mut buf).await, Ok(0) | Err(_)));
        assert_eq!(acceptor.active_clients(), 0);
    }

    #[tokio::test]
    async fn tcp_relay_stops_on_cancel() {
        let handler = handler();
        let (_acceptor, _conn, client) = accept_tcp().await;
        let cancel = CancellationToken::new();
        let relay = tokio::spawn({
            let handler = handler.clone();
            let cancel = cancel.clone();
            // No header is ever sent, so the relay waits in the handshake
            async move { handler.handle_tcp(client, cancel).await }
        });

        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dispose_aborts_relays() {
        let handler = handler();
        let (_acceptor, _conn, client) = accept_tcp().await;
        let relay = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle_tcp(client, CancellationToken::new()).await }
        });

        handler.dispose();
        handler.dispose();

        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn udp_relays_and_frames_replies() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..len], from).await;
            }
        });

        let acceptor = UdpAcceptor::new("127.0.0.1:0".parse().unwrap(), 4, Duration::from_secs(5));
        acceptor.listen().await.unwrap();
        let relay_addr = acceptor.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut datagram = Vec::new();
        TargetAddr::Ip(echo_addr).write_to(&mut datagram);
        datagram.extend_from_slice(b"dns?");
        peer.send_to(&datagram, relay_addr).await.unwrap();

        let client = acceptor.accept().await.unwrap();
        let handler = handler();
        let cancel = CancellationToken::new();
        let relay = tokio::spawn({
            let handler = handler.clone();
            let cancel = cancel.clone();
            async move { handler.handle_udp(client, cancel).await }
        });

        let mut buf = [0u8; 1500];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (from, header_len) = TargetAddr::parse(&buf[..len]).unwrap();
        assert_eq!(from, TargetAddr::Ip(echo_addr));
        assert_eq!(&buf[header_len..len], b"dns?");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }
}
