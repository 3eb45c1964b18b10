//! Error types for the SNI proxy.
//!
//! Errors fall into three groups:
//! - [`ConfigError`]: rejected at construction time, the proxy is never built.
//! - [`SniError`]: the decoy handshake could not learn a server name.
//! - [`ProxyError`]: a single connection was aborted. These are logged by the
//!   accept loop and never surface to the caller of `listen_and_proxy`.

use std::io;

use thiserror::Error;

/// Invalid proxy options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// SNI routing is disabled, so every connection needs the default address.
    #[error("a default address is required when SNI routing is disabled")]
    MissingDefaultAddress,

    /// SNI routing is enabled but there is nothing to route to.
    #[error("SNI routing is enabled but the service map is empty")]
    EmptyServiceMap,

    /// A service map entry has an empty server name.
    #[error("service map contains an empty server name")]
    EmptyServerName,

    /// A service map entry has an empty destination address.
    #[error("service map entry '{server_name}' has an empty address")]
    EmptyServiceAddress { server_name: String },

    /// Two service map keys name the same server once normalized.
    #[error("service map lists '{server_name}' more than once (names are case-insensitive)")]
    DuplicateServerName { server_name: String },

    /// The token pool must hold at least one token.
    #[error("max concurrent connections must be at least 1")]
    ZeroMaxConnections,

    /// The decoy TLS server (placeholder certificate or shared server
    /// config) could not be set up.
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl From<rustls::Error> for ConfigError {
    fn from(err: rustls::Error) -> Self {
        ConfigError::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for ConfigError {
    fn from(err: rcgen::Error) -> Self {
        ConfigError::Tls(err.to_string())
    }
}

/// Failure to extract a server name from a connection.
#[derive(Debug, Error)]
pub enum SniError {
    /// The peer did not send a parseable TLS ClientHello.
    #[error("not a TLS connection: {0}")]
    NotTls(#[source] io::Error),

    /// The peer did not finish sending its ClientHello in time.
    #[error("timed out waiting for TLS ClientHello")]
    Timeout,
}

/// Reason a single proxied connection was aborted.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("SNI extraction failed: {0}")]
    Sni(#[from] SniError),

    /// Neither a service map entry nor a default address applies.
    #[error("no destination resolvable for server name '{server_name}'")]
    NoDestination { server_name: String },

    /// Every dial attempt failed; `source` is the last error.
    #[error("failed to dial {addr} after {attempts} attempt(s): {source}")]
    Dial {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// Writing the buffered handshake prefix to the destination failed.
    #[error("failed to replay handshake bytes: {0}")]
    Replay(#[source] io::Error),
}
