//! SNI passthrough proxy
//!
//! Routes tunnel TLS traffic to backend services without terminating TLS.
//!
//! This service:
//! - Accepts TCP connections on the configured address
//! - Reads the server name from the TLS ClientHello through a decoy handshake
//! - Picks a destination from the service map or the default address
//! - Replays the handshake and splices the connection to the destination
//!
//! Accepted sockets are injected into the proxy through an injection
//! listener, so ctrl-c can close it and let the proxy shut down in order.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sni_proxy::config::Config;
use sni_proxy::{inject, Injector, ListenerClosed, Proxy};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNI_PROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SNI proxy");

    let proxy = Proxy::new(config.proxy).context("Invalid proxy configuration.")?;
    let options = proxy.options();
    info!(
        listen_addr = %config.listen_addr,
        default_addr = ?options.default_addr,
        route_on_sni = options.route_on_sni,
        service_count = options.services.len(),
        max_connections = options.max_connections,
        fips = options.fips,
        "Configuration loaded"
    );

    let tcp = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(bind_addr = %tcp.local_addr()?, "Listener bound");

    let (injector, listener) = inject::channel::<TcpStream>();
    let accept_handle = tokio::spawn(run_tcp_accept(tcp, injector.clone()));
    let proxy_handle = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.listen_and_proxy(listener).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = accept_handle => {
            if let Err(e) = result {
                error!(error = %e, "TCP accept task panicked");
            }
        }
    }

    // Closing the listener drives the proxy through its orderly shutdown.
    injector.close();
    match proxy_handle.await {
        Ok(Err(e)) if ListenerClosed::is(&e) => {}
        Ok(Err(e)) => warn!(error = %e, "Proxy stopped with error"),
        Ok(Ok(())) => {}
        Err(e) => error!(error = %e, "Proxy task panicked"),
    }

    info!("SNI proxy shutdown complete");
    Ok(())
}

/// Accept TCP connections and hand them to the proxy.
async fn run_tcp_accept(tcp: TcpListener, injector: Injector<TcpStream>) {
    loop {
        match tcp.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(peer_addr = %peer_addr, "Accepted TCP connection");
                if injector.send(stream).await.is_err() {
                    info!("Proxy listener closed, stopping TCP accept loop");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
