//! Relay server orchestration.
//!
//! Owns the TCP and UDP acceptors, the tunnel handler and the cancellation
//! token for one bind address, and runs an accept loop per transport.
//!
//! `start` and `stop` serialize on one lock. Each `start` builds fresh
//! acceptors, a fresh handler and a fresh token; `stop` cancels the token,
//! stops both acceptors, waits for the loops, disposes the handler and gives
//! in-flight relays a grace period to finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RemoteConfig;
use crate::handler::{PlainTunnelHandler, TunnelHandler};
use crate::resolver::DnsResolver;
use crate::stats::RelayStats;
use crate::transport::{Acceptor, TcpAcceptor, TcpClient, UdpAcceptor, UdpClient};

/// Builds the tunnel handler for each `start`.
pub type HandlerFactory =
    Arc<dyn Fn(&RemoteConfig, Arc<DnsResolver>) -> Arc<dyn TunnelHandler> + Send + Sync>;

#[derive(Default)]
struct ServerState {
    tcp: Option<Arc<TcpAcceptor>>,
    udp: Option<Arc<UdpAcceptor>>,
    handler: Option<Arc<dyn TunnelHandler>>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    relays: Option<TaskTracker>,
}

pub struct RelayServer {
    config: RemoteConfig,
    resolver: Arc<DnsResolver>,
    handler_factory: HandlerFactory,
    stats: Arc<RelayStats>,
    state: Mutex<ServerState>,
}

impl RelayServer {
    /// Create a server relaying through [`PlainTunnelHandler`].
    pub fn new(config: RemoteConfig, resolver: Arc<DnsResolver>) -> Self {
        Self {
            config,
            resolver,
            handler_factory: Arc::new(plain_handler),
            stats: Arc::new(RelayStats::new()),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Replace the tunnel handler used from the next `start`.
    pub fn with_handler_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RemoteConfig, Arc<DnsResolver>) -> Arc<dyn TunnelHandler> + Send + Sync + 'static,
    {
        self.handler_factory = Arc::new(factory);
        self
    }

    /// Bind both transports and launch the accept loops.
    ///
    /// Listen failures are logged, not returned: the TCP loop runs only if the
    /// TCP acceptor is listening, and the UDP loop only if both are, since UDP
    /// association is negotiated over TCP. A no-op while already running or
    /// when the config fails validation.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.cancel.is_some() {
            warn!("relay server already running");
            return;
        }
        if let Err(e) = self.config.validate() {
            error!("relay server not started: {}", e);
            return;
        }

        let cancel = CancellationToken::new();
        let handler = (self.handler_factory)(&self.config, self.resolver.clone());
        let bind_addr = self.config.bind_addr();

        let tcp = Arc::new(TcpAcceptor::new(bind_addr, self.config.max_clients));
        if let Err(e) = tcp.listen().await {
            error!(addr = %bind_addr, "TCP listen failed: {}", e);
        }

        // Share the port TCP actually bound when configured with port 0
        let udp_addr = tcp.local_addr().unwrap_or(bind_addr);
        let udp = Arc::new(UdpAcceptor::new(
            udp_addr,
            self.config.max_clients,
            self.config.udp_idle_timeout(),
        ));
        if let Err(e) = udp.listen().await {
            error!(addr = %udp_addr, "UDP listen failed: {}", e);
        }

        let relays = TaskTracker::new();
        let mut tasks = Vec::new();

        if tcp.is_running() {
            tasks.push(tokio::spawn(run_accept_loop(
                tcp.clone(),
                handler.clone(),
                cancel.clone(),
                relays.clone(),
                self.stats.clone(),
                dispatch_tcp,
            )));
        }
        if tcp.is_running() && udp.is_running() {
            tasks.push(tokio::spawn(run_accept_loop(
                udp.clone(),
                handler.clone(),
                cancel.clone(),
                relays.clone(),
                self.stats.clone(),
                dispatch_udp,
            )));
        } else {
            warn!("UDP relay disabled: both TCP and UDP acceptors must be listening");
        }

        tasks.push(tokio::spawn(sweep_dns_cache(
            self.resolver.clone(),
            self.config.dns_sweep_interval(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(report_stats(
            self.stats.clone(),
            self.resolver.clone(),
            self.config.stats_interval(),
            cancel.clone(),
        )));

        info!(
            addr = %tcp.local_addr().unwrap_or(bind_addr),
            tcp = tcp.is_running(),
            udp = udp.is_running(),
            "relay server started"
        );

        *state = ServerState {
            tcp: Some(tcp),
            udp: Some(udp),
            handler: Some(handler),
            cancel: Some(cancel),
            tasks,
            relays: Some(relays),
        };
    }

    /// Stop listening and shut down the handler.
    ///
    /// Safe to call before `start` and more than once.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        let Some(cancel) = state.cancel.take() else {
            debug!("relay server not running");
            return;
        };
        cancel.cancel();
        info!(
            tcp_clients = state.tcp.as_ref().map_or(0, |tcp| tcp.active_clients()),
            udp_clients = state.udp.as_ref().map_or(0, |udp| udp.active_clients()),
            "relay server stopping"
        );

        if let Some(tcp) = &state.tcp {
            tcp.stop_listen();
        }
        if let Some(udp) = &state.udp {
            udp.stop_listen();
        }

        let tasks = std::mem::take(&mut state.tasks);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("server task panicked: {}", e);
                }
            }
        }

        if let Some(handler) = state.handler.take() {
            handler.dispose();
        }

        if let Some(relays) = state.relays.take() {
            relays.close();
            let grace = self.config.shutdown_grace();
            if tokio::time::timeout(grace, relays.wait()).await.is_err() {
                warn!(
                    remaining = relays.len(),
                    grace_secs = grace.as_secs(),
                    "relays still running after shutdown grace"
                );
            }
        }

        info!("relay server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.cancel.is_some()
    }

    /// TCP acceptor of the current or most recent run.
    pub async fn tcp_acceptor(&self) -> Option<Arc<TcpAcceptor>> {
        self.state.lock().await.tcp.clone()
    }

    /// UDP acceptor of the current or most recent run.
    pub async fn udp_acceptor(&self) -> Option<Arc<UdpAcceptor>> {
        self.state.lock().await.udp.clone()
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<DnsResolver> {
        &self.resolver
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }
}

fn plain_handler(config: &RemoteConfig, resolver: Arc<DnsResolver>) -> Arc<dyn TunnelHandler> {
    Arc::new(PlainTunnelHandler::new(config, resolver))
}

async fn dispatch_tcp(handler: Arc<dyn TunnelHandler>, client: TcpClient, cancel: CancellationToken) {
    handler.handle_tcp(client, cancel).await
}

async fn dispatch_udp(handler: Arc<dyn TunnelHandler>, client: UdpClient, cancel: CancellationToken) {
    handler.handle_udp(client, cancel).await
}

/// Accept clients until cancelled or the acceptor dies.
///
/// Clients are taken in arrival order; each one is handed to its own relay
/// task so a long relay never holds up the next accept.
async fn run_accept_loop<A, F, Fut>(
    acceptor: Arc<A>,
    handler: Arc<dyn TunnelHandler>,
    cancel: CancellationToken,
    relays: TaskTracker,
    stats: Arc<RelayStats>,
    dispatch: F,
) where
    A: Acceptor,
    F: Fn(Arc<dyn TunnelHandler>, A::Client, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let protocol = acceptor.protocol();
    debug!("{} accept loop started", protocol);

    while !cancel.is_cancelled() && acceptor.is_running() {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            client = acceptor.accept() => client,
        };

        let Some(client) = accepted else {
            if !cancel.is_cancelled() {
                warn!("{} acceptor returned no client, stopping accept loop", protocol);
            }
            break;
        };

        if cancel.is_cancelled() {
            // Dropping the handle closes the late client
            stats.record_late_dropped();
            drop(client);
            return;
        }

        stats.record_accepted(protocol);
        relays.spawn(dispatch(handler.clone(), client, cancel.clone()));
    }

    debug!("{} accept loop stopped", protocol);
}

async fn sweep_dns_cache(resolver: Arc<DnsResolver>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let removed = resolver.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = resolver.cache_len(), "swept expired DNS entries");
                }
            }
        }
    }
}

async fn report_stats(
    stats: Arc<RelayStats>,
    resolver: Arc<DnsResolver>,
    every: Duration,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let relay = stats.snapshot_and_reset();
                let dns = resolver.stats_snapshot_and_reset();
                info!(
                    uptime_secs = started.elapsed().as_secs(),
                    tcp_clients = relay.tcp_clients,
                    udp_clients = relay.udp_clients,
                    late_dropped = relay.late_dropped,
                    dns_cache = resolver.cache_len(),
                    dns_hits = dns.hits,
                    dns_misses = dns.misses,
                    dns_failures = dns.failures,
                    "[stats]"
                );
            }
        }
    }
}
