//! Bounded-concurrency accept loop.
//!
//! Each accepted connection is handled by its own task:
//! SNI extraction -> routing -> dial -> replay of the handshake prefix ->
//! bidirectional forwarding. A semaphore bounds how many connections are in
//! flight; a permit is taken *before* accepting, so a full pool stops the
//! loop from accepting at all.
//!
//! When the listener's accept fails (including because it was closed), the
//! loop stops, every in-flight connection is force-closed through a shared
//! shutdown signal, and the accept error is returned once all connection
//! tasks have finished.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use super::accept::Accept;
use super::dialer::Dialer;
use super::forward::forward;
use super::options::ProxyOptions;
use super::router::Router;
use super::sni::SniExtractor;
use super::tls::TlsConfigFactory;
use crate::error::{ConfigError, ProxyError, SniError};

/// Statistics for a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections whose handling has finished.
    pub connections_closed: AtomicU64,
    /// ClientHellos carrying a server name.
    pub sni_found: AtomicU64,
    /// ClientHellos without a server name.
    pub sni_missing: AtomicU64,
    /// Connections that were not TLS or timed out before the ClientHello.
    pub sni_failed: AtomicU64,
    /// Connections with no resolvable destination.
    pub routes_failed: AtomicU64,
    /// Connections whose destination could not be dialed.
    pub dial_failed: AtomicU64,
    /// Connections force-closed by shutdown.
    pub shutdown_closed: AtomicU64,
    /// Bytes sent to destinations, including the replayed prefix.
    pub bytes_to_backend: AtomicU64,
    /// Bytes received from destinations.
    pub bytes_from_backend: AtomicU64,
}

/// Lifecycle of [`Proxy::listen_and_proxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    NotStarted,
    Accepting,
    ShuttingDown,
    Stopped,
}

struct Inner {
    options: ProxyOptions,
    extractor: SniExtractor,
    router: Router,
    dialer: Dialer,
    stats: ProxyStats,
    state: watch::Sender<ProxyState>,
}

/// An SNI passthrough proxy.
///
/// Cheap to clone; clones share options and statistics.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    /// Validate `options` and build the proxy.
    pub fn new(options: ProxyOptions) -> Result<Self, ConfigError> {
        options.validate()?;

        let extractor = SniExtractor::new(TlsConfigFactory::new(options.fips)?)?;
        let router = Router::new(
            options.route_on_sni,
            options.default_addr.clone(),
            &options.services,
        );
        let dialer = Dialer::new(
            options.retry_attempts,
            options.retry_interval,
            options.connect_timeout,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                extractor,
                router,
                dialer,
                stats: ProxyStats::default(),
                state: watch::Sender::new(ProxyState::NotStarted),
            }),
        })
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.inner.options
    }

    /// Get proxy statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.inner.stats
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ProxyState> {
        self.inner.state.subscribe()
    }

    /// Accept connections from `listener` and proxy them until it fails.
    ///
    /// Per-connection failures are logged and never returned. This only
    /// returns once the listener's accept has failed and every in-flight
    /// connection has been closed; the result is always that accept error.
    pub async fn listen_and_proxy<L: Accept>(&self, mut listener: L) -> io::Result<()> {
        let max_connections = self.inner.options.max_connections;
        let permits = Arc::new(Semaphore::new(max_connections));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;

        self.inner.state.send_replace(ProxyState::Accepting);
        info!(max_connections, "Proxy accepting connections");

        let accept_error = loop {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed.
                Err(e) => break io::Error::other(e),
            };

            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => break e,
            };

            // Reap finished tasks so the set does not grow without bound.
            reap_finished(&mut tasks);

            next_id += 1;
            let stats = &self.inner.stats;
            stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            stats.connections_active.fetch_add(1, Ordering::Relaxed);

            let inner = Arc::clone(&self.inner);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(
                async move {
                    tokio::select! {
                        result = inner.handle_connection(conn) => {
                            if let Err(e) = result {
                                inner.record_failure(&e);
                            }
                        }
                        _ = shutdown_signalled(shutdown) => {
                            inner.stats.shutdown_closed.fetch_add(1, Ordering::Relaxed);
                            debug!("Connection force-closed by shutdown");
                        }
                    }

                    inner.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    inner.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", id = next_id)),
            );
        };

        info!(error = %accept_error, "Accept failed, shutting down");
        self.inner.state.send_replace(ProxyState::ShuttingDown);
        let _ = shutdown_tx.send(true);

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Connection task panicked");
            }
        }

        self.inner.state.send_replace(ProxyState::Stopped);
        info!("Proxy stopped");
        Err(accept_error)
    }
}

impl Inner {
    /// Handle a single connection from ClientHello to close.
    async fn handle_connection<C>(&self, mut client: C) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let probe = match self.options.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, self.extractor.extract(&mut client))
                .await
                .map_err(|_| SniError::Timeout)??,
            None => self.extractor.extract(&mut client).await?,
        };

        match &probe.server_name {
            Some(server_name) => {
                self.stats.sni_found.fetch_add(1, Ordering::Relaxed);
                debug!(server_name = %server_name, "SNI extracted");
            }
            None => {
                self.stats.sni_missing.fetch_add(1, Ordering::Relaxed);
                debug!("No SNI in ClientHello");
            }
        }

        let (addr, source) = self.router.resolve(probe.server_name())?;
        let mut backend = self.dialer.dial(addr).await?;
        debug!(addr, route = ?source, "Connected to destination");

        backend
            .write_all(&probe.bytes_read)
            .await
            .map_err(ProxyError::Replay)?;
        self.stats
            .bytes_to_backend
            .fetch_add(probe.bytes_read.len() as u64, Ordering::Relaxed);

        let forwarded = forward(client, backend).await;
        self.stats
            .bytes_to_backend
            .fetch_add(forwarded.a_to_b, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(forwarded.b_to_a, Ordering::Relaxed);

        debug!(
            bytes_to_backend = forwarded.a_to_b + probe.bytes_read.len() as u64,
            bytes_from_backend = forwarded.b_to_a,
            "Connection closed"
        );

        Ok(())
    }

    fn record_failure(&self, err: &ProxyError) {
        match err {
            ProxyError::Sni(_) => {
                self.stats.sni_failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "Dropping connection");
            }
            ProxyError::NoDestination { .. } => {
                self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "Dropping connection");
            }
            ProxyError::Dial { .. } => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "Dropping connection");
            }
            ProxyError::Replay(_) => {
                debug!(error = %err, "Dropping connection");
            }
        }
    }
}

/// Remove finished tasks from `tasks`, logging any that panicked.
///
/// Returns how many of the reaped tasks panicked.
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut panicked = 0;
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "Connection task panicked");
            panicked += 1;
        }
    }
    panicked
}

/// Resolve once shutdown has been signalled.
async fn shutdown_signalled(mut shutdown: watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}
