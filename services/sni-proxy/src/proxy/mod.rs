//! TLS passthrough proxy routed on SNI.
//!
//! This module provides:
//! - A bounded-concurrency accept loop
//! - SNI extraction through a decoy TLS handshake
//! - Destination selection from a static service map
//! - Dialing with retries
//! - Byte-for-byte replay of the handshake prefix and bidirectional forwarding
//! - A listener that can be fed connections programmatically
//!
//! ## Architecture
//!
//! ```text
//! Listener -> token pool -> SNI extractor -> Router -> Dialer -> replay -> forward
//!                              |
//!                      ReadOnlyStream (writes refused)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sni_proxy::{Proxy, ProxyOptions};
//!
//! let proxy = Proxy::new(
//!     ProxyOptions::new()
//!         .route_on_sni(true)
//!         .service("svc.example", "10.0.0.5:9443")
//!         .default_address("10.0.0.9:443"),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("[::]:8443").await?;
//! proxy.listen_and_proxy(listener).await?;
//! ```

mod accept;
mod dialer;
mod forward;
pub mod inject;
mod listener;
mod options;
mod read_only;
mod router;
mod sni;
mod tls;

pub use accept::Accept;
pub use dialer::{Dialer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_INTERVAL};
pub use forward::{forward, ForwardStats};
pub use inject::{InjectListener, Injector, ListenerClosed};
pub use listener::{Proxy, ProxyState, ProxyStats};
pub use options::{ProxyOptions, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
pub use read_only::{AttemptedWrite, ReadOnlyStream};
pub use router::{RouteSource, Router};
pub use sni::{normalize_server_name, ProbeOutcome, SniExtractor, SniProbe};
pub use tls::TlsConfigFactory;
