//! Proxy options.
//!
//! Options are collected with a consuming builder and validated once by
//! [`ProxyOptions::validate`] when the proxy is constructed. After that they
//! are immutable.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::dialer::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_INTERVAL};
use super::sni::normalize_server_name;
use crate::error::ConfigError;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default limit on how long a client may take to send its ClientHello.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Options for building a [`Proxy`](super::Proxy).
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Destination when SNI routing is off or finds no match.
    pub default_addr: Option<String>,
    /// Route on the ClientHello server name.
    pub route_on_sni: bool,
    /// Server name to `host:port`.
    pub services: HashMap<String, String>,
    /// Dial attempts after the first one.
    pub retry_attempts: u32,
    /// Delay between dial attempts.
    pub retry_interval: Duration,
    /// Per-attempt dial timeout. Zero disables it.
    pub connect_timeout: Duration,
    /// Size of the token pool.
    pub max_connections: usize,
    /// Restrict the decoy TLS server to the FIPS policy.
    pub fips: bool,
    /// Time allowed for the ClientHello to arrive. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            default_addr: None,
            route_on_sni: false,
            services: HashMap::new(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            fips: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_address(mut self, addr: impl Into<String>) -> Self {
        self.default_addr = Some(addr.into());
        self
    }

    pub fn route_on_sni(mut self, enabled: bool) -> Self {
        self.route_on_sni = enabled;
        self
    }

    /// Add a single service map entry.
    pub fn service(mut self, server_name: impl Into<String>, addr: impl Into<String>) -> Self {
        self.services.insert(server_name.into(), addr.into());
        self
    }

    /// Replace the whole service map.
    pub fn services(mut self, services: HashMap<String, String>) -> Self {
        self.services = services;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn fips(mut self, enabled: bool) -> Self {
        self.fips = enabled;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Check the option invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.route_on_sni && self.default_addr.is_none() {
            return Err(ConfigError::MissingDefaultAddress);
        }

        if self.route_on_sni && self.services.is_empty() {
            return Err(ConfigError::EmptyServiceMap);
        }

        // Keys are matched after normalization, so they must stay unique after it.
        let mut normalized = HashSet::with_capacity(self.services.len());
        for (server_name, addr) in &self.services {
            let name = normalize_server_name(server_name);
            if name.is_empty() {
                return Err(ConfigError::EmptyServerName);
            }
            if addr.is_empty() {
                return Err(ConfigError::EmptyServiceAddress {
                    server_name: server_name.clone(),
                });
            }
            if !normalized.insert(name) {
                return Err(ConfigError::DuplicateServerName {
                    server_name: normalize_server_name(server_name),
                });
            }
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }

        Ok(())
    }
}
