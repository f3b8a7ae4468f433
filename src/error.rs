//! Error types for the relay server.

use std::io;

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the relay.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be read
    #[error("failed to read config {path}: {source}")]
    ConfigRead { path: String, source: io::Error },

    /// Configuration file is not valid JSON for the expected shape
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Configuration values are out of range
    #[error("invalid config: {0}")]
    Config(String),

    /// Acceptor was stopped and cannot listen again
    #[error("{0} acceptor has been stopped")]
    AcceptorStopped(&'static str),

    /// Target address header is malformed
    #[error("invalid target address: {0}")]
    InvalidAddress(String),

    /// Unknown SOCKS5 address type byte
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Host name did not resolve to any address
    #[error("could not resolve host {0}")]
    Unresolved(String),

    /// Operation did not complete in time
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Error::InvalidAddress(msg.into())
    }
}
