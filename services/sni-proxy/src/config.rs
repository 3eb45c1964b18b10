//! SNI proxy configuration (env-driven).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::{
    ProxyOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_INTERVAL,
};

/// Configuration for the `sni-proxy` binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept client connections on.
    pub listen_addr: SocketAddr,

    /// Options handed to the proxy.
    pub proxy: ProxyOptions,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = lookup("SNI_PROXY_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8443".to_string())
            .parse()
            .context("SNI_PROXY_LISTEN_ADDR must be a socket address (host:port).")?;

        let default_addr = lookup("SNI_PROXY_DEFAULT_ADDR").filter(|v| !v.is_empty());

        let route_on_sni = lookup("SNI_PROXY_ROUTE_ON_SNI")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let services = lookup("SNI_PROXY_SERVICE_MAP")
            .map(|v| parse_service_map(&v))
            .transpose()
            .context("SNI_PROXY_SERVICE_MAP must look like name=host:port,name=host:port.")?
            .unwrap_or_default();

        let retry_attempts: u32 = lookup("SNI_PROXY_RETRY_ATTEMPTS")
            .map(|v| v.parse())
            .transpose()
            .context("SNI_PROXY_RETRY_ATTEMPTS must be a non-negative integer.")?
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS);

        let retry_interval = lookup_millis(&lookup, "SNI_PROXY_RETRY_INTERVAL_MS")?
            .unwrap_or(DEFAULT_RETRY_INTERVAL);

        let connect_timeout = lookup_millis(&lookup, "SNI_PROXY_CONNECT_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let max_connections: usize = lookup("SNI_PROXY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("SNI_PROXY_MAX_CONNECTIONS must be a positive integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let fips = lookup("SNI_PROXY_FIPS_MODE")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        // Zero turns the handshake timeout off.
        let handshake_timeout = match lookup_millis(&lookup, "SNI_PROXY_HANDSHAKE_TIMEOUT_MS")? {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => DEFAULT_HANDSHAKE_TIMEOUT,
        };

        let log_level = lookup("SNI_PROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let mut proxy = ProxyOptions::new()
            .route_on_sni(route_on_sni)
            .services(services)
            .retry_attempts(retry_attempts)
            .retry_interval(retry_interval)
            .connect_timeout(connect_timeout)
            .max_connections(max_connections)
            .fips(fips)
            .handshake_timeout(handshake_timeout);
        if let Some(addr) = default_addr {
            proxy = proxy.default_address(addr);
        }

        Ok(Self {
            listen_addr,
            proxy,
            log_level,
        })
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn lookup_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|v| v.parse::<u64>().map(Duration::from_millis))
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))
}

/// Parse `name=host:port` pairs separated by commas.
///
/// Whitespace around entries is ignored and empty entries are skipped.
pub fn parse_service_map(value: &str) -> Result<HashMap<String, String>> {
    let mut services = HashMap::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, addr)) = entry.split_once('=') else {
            bail!("service map entry '{entry}' is missing '='");
        };
        let (name, addr) = (name.trim(), addr.trim());
        if name.is_empty() || addr.is_empty() {
            bail!("service map entry '{entry}' has an empty name or address");
        }
        if services.insert(name.to_string(), addr.to_string()).is_some() {
            bail!("service map lists '{name}' more than once");
        }
    }

    Ok(services)
}
