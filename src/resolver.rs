//! Host name resolution with memoization.
//!
//! Lookup pipeline:
//! 1. IP literals resolve to themselves
//! 2. Cache lookup
//! 3. One upstream lookup on miss; only non-empty results are cached
//!
//! Failures are logged and reported as `None`, never raised to the caller.

use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::TtlCache;
use crate::stats::{ResolverStats, ResolverStatsSnapshot};

/// How long a successful resolution stays cached.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default number of host names kept in the cache.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Resolved addresses for one host, in upstream order.
pub type Addresses = Arc<[IpAddr]>;

/// Upstream source of host name resolutions.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// getaddrinfo messages for names that do not exist (EAI_NONAME, EAI_NODATA).
const NOT_FOUND_MESSAGES: [&str; 3] = [
    "Name or service not known",
    "No address associated with hostname",
    "nodename nor servname provided, or not known",
];

/// Resolves through the operating system resolver.
///
/// Missing names come back as `ErrorKind::NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(not_found_kind)?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// getaddrinfo failures carry no error kind; tag missing names as `NotFound`.
fn not_found_kind(err: io::Error) -> io::Error {
    let message = err.to_string();
    if NOT_FOUND_MESSAGES.iter().any(|m| message.contains(m)) {
        io::Error::new(io::ErrorKind::NotFound, message)
    } else {
        err
    }
}

/// Why a resolution produced no addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Name does not exist or has no addresses.
    NotFound,
    /// Network or resolver error that may succeed on retry.
    Transient,
}

impl FailureCause {
    fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => FailureCause::NotFound,
            _ => FailureCause::Transient,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FailureCause::NotFound => "not found",
            FailureCause::Transient => "transient",
        }
    }
}

/// Caching host resolver.
///
/// Concurrent misses for the same host are not coalesced; each caller may
/// reach upstream until one success is cached.
pub struct DnsResolver {
    cache: TtlCache<String, Addresses>,
    lookup: Arc<dyn HostLookup>,
    ttl: Duration,
    stats: ResolverStats,
}

impl DnsResolver {
    /// Create a resolver over the system resolver with default TTL and capacity.
    pub fn new() -> Self {
        Self::with_lookup(Arc::new(SystemLookup), DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    /// Create a resolver with an explicit upstream, cache capacity and TTL.
    ///
    /// A capacity of zero is treated as one.
    pub fn with_lookup(lookup: Arc<dyn HostLookup>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: TtlCache::new(capacity),
            lookup,
            ttl,
            stats: ResolverStats::new(),
        }
    }

    /// Resolve `host` to its addresses.
    ///
    /// Returns `None` if the lookup failed or yielded no addresses.
    pub async fn resolve_host(&self, host: &str) -> Option<Addresses> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(Arc::from([ip]));
        }

        let key = host.to_ascii_lowercase();
        if let Some(addrs) = self.cache.get(&key) {
            self.stats.record_hit();
            return Some(addrs);
        }
        self.stats.record_miss();

        info!(host = %key, "resolving");
        match self.lookup.lookup(&key).await {
            Ok(addrs) if !addrs.is_empty() => {
                info!(host = %key, first = %addrs[0], count = addrs.len(), "resolved");
                let addrs: Addresses = addrs.into();
                self.cache.set(key, addrs.clone(), self.ttl);
                Some(addrs)
            }
            Ok(_) => {
                self.stats.record_failure();
                warn!(
                    host = %key,
                    cause = FailureCause::NotFound.as_str(),
                    "resolve failed: no addresses"
                );
                None
            }
            Err(e) => {
                self.stats.record_failure();
                warn!(
                    host = %key,
                    cause = FailureCause::classify(&e).as_str(),
                    "resolve failed: {}",
                    e
                );
                None
            }
        }
    }

    /// Drop expired cache entries.
    pub fn sweep_expired(&self) -> usize {
        self.cache.remove_expired()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn stats_snapshot_and_reset(&self) -> ResolverStatsSnapshot {
        self.stats.snapshot_and_reset()
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
