//! Configuration types.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub remote_server: RemoteConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

impl AppConfig {
    /// Load from `path`, or return defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.remote_server.validate()?;
        Ok(config)
    }
}

/// Relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_server_address")]
    pub server_address: IpAddr,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Ceiling on live clients per transport
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// UDP peer sessions end after this much silence
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    #[serde(default = "default_dns_cache_capacity")]
    pub dns_cache_capacity: usize,

    #[serde(default = "default_dns_ttl_secs")]
    pub dns_ttl_secs: u64,

    #[serde(default = "default_dns_sweep_interval_secs")]
    pub dns_sweep_interval_secs: u64,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// How long `stop` waits for in-flight relays
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_server_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_server_port() -> u16 {
    8388
}

fn default_max_clients() -> usize {
    1024
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_udp_idle_timeout_secs() -> u64 {
    300
}

fn default_dns_cache_capacity() -> usize {
    4096
}

fn default_dns_ttl_secs() -> u64 {
    30 * 60
}

fn default_dns_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_port: default_server_port(),
            max_clients: default_max_clients(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            dns_cache_capacity: default_dns_cache_capacity(),
            dns_ttl_secs: default_dns_ttl_secs(),
            dns_sweep_interval_secs: default_dns_sweep_interval_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl RemoteConfig {
    /// Config bound to `bind_addr` with defaults for everything else.
    pub fn new(bind_addr: SocketAddr, max_clients: usize) -> Self {
        Self {
            server_address: bind_addr.ip(),
            server_port: bind_addr.port(),
            max_clients,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_address, self.server_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(Error::config("max_clients must be greater than 0"));
        }
        if self.dns_cache_capacity == 0 {
            return Err(Error::config("dns_cache_capacity must be greater than 0"));
        }
        let intervals = [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("udp_idle_timeout_secs", self.udp_idle_timeout_secs),
            ("dns_ttl_secs", self.dns_ttl_secs),
            ("dns_sweep_interval_secs", self.dns_sweep_interval_secs),
            ("stats_interval_secs", self.stats_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::config(format!("{} must be greater than 0", name)));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_secs)
    }

    pub fn dns_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dns_sweep_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Log destinations and levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory for the daily rolling log file
    #[serde(default = "default_log_directory")]
    pub directory: String,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Console filter, used when `RUST_LOG` is unset
    #[serde(default = "default_console_level")]
    pub console_level: String,

    /// Minimum level written to the log file
    #[serde(default = "default_file_level")]
    pub file_level: String,
}

fn default_log_directory() -> String {
    "logs".to_string()
}

fn default_log_file_prefix() -> String {
    "ssrelay.log".to_string()
}

fn default_console_level() -> String {
    "info".to_string()
}

fn default_file_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            console_level: default_console_level(),
            file_level: default_file_level(),
        }
    }
}
