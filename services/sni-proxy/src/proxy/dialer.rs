//! Outbound connections with retry.
//!
//! One initial attempt plus `retry_attempts` retries, each bounded by the
//! connect timeout, with a fixed `retry_interval` sleep between attempts.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ProxyError;

/// Default number of retries after the first dial attempt.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default delay between dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Default connect timeout per attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials destinations, retrying with a fixed delay.
#[derive(Debug, Clone)]
pub struct Dialer {
    retry_attempts: u32,
    retry_interval: Duration,
    /// Zero disables the per-attempt timeout.
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(retry_attempts: u32, retry_interval: Duration, connect_timeout: Duration) -> Self {
        Self {
            retry_attempts,
            retry_interval,
            connect_timeout,
        }
    }

    /// Total number of attempts a dial may make.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }

    /// Connect to `addr`, returning the last error if every attempt fails.
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, ProxyError> {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(addr, attempt, "Dialing destination");

            match self.try_connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Ok(stream);
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        addr,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Dial failed, retrying"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => {
                    warn!(addr, attempts = attempt, error = %e, "Dial failed, giving up");
                    return Err(ProxyError::Dial {
                        addr: addr.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn try_connect(&self, addr: &str) -> io::Result<TcpStream> {
        if self.connect_timeout.is_zero() {
            return TcpStream::connect(addr).await;
        }

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_ATTEMPTS,
            DEFAULT_RETRY_INTERVAL,
            DEFAULT_CONNECT_TIMEOUT,
        )
    }
}
