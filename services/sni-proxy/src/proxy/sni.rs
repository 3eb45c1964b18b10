//! SNI (Server Name Indication) extraction through a decoy TLS handshake.
//!
//! Instead of parsing the ClientHello by hand, a real rustls server is run
//! against the connection wrapped in a [`ReadOnlyStream`]. rustls reads and
//! validates the ClientHello, reports the requested name to our certificate
//! resolver, and then tries to send its ServerHello. That write is refused,
//! which stops the handshake before a single byte reaches the client.
//!
//! The bytes read during the probe must be replayed verbatim to the real
//! destination: the TLS session belongs to the client and the destination,
//! this proxy never takes part in it.

use std::sync::{Arc, OnceLock};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::read_only::{AttemptedWrite, ReadOnlyStream};
use super::tls::TlsConfigFactory;
use crate::error::{ConfigError, SniError};

/// How the decoy handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The ClientHello was parsed and the server was stopped at its first write.
    Intercepted,
    /// The handshake finished without writing. Not expected in practice, the
    /// server name and bytes are still valid.
    Completed,
}

/// Result of a successful probe.
#[derive(Debug, Clone)]
pub struct SniProbe {
    /// Normalized server name, `None` if the client sent no SNI.
    pub server_name: Option<String>,
    /// Everything read from the client, to be replayed to the destination.
    pub bytes_read: Vec<u8>,
    pub outcome: ProbeOutcome,
}

impl SniProbe {
    /// The server name, or `""` if none was sent.
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or("")
    }
}

/// Normalize a server name for matching: lowercase, trailing dot trimmed.
pub fn normalize_server_name(name: &str) -> String {
    name.to_lowercase().trim_end_matches('.').to_string()
}

tokio::task_local! {
    /// Where the resolver reports the ClientHello of the probe running on
    /// the current task.
    static HELLO: Arc<HelloSlot>;
}

/// Extracts server names by running a decoy TLS server.
///
/// One server config is shared by every probe. Its resolver reports to the
/// slot scoped to the task running the handshake, so concurrent
/// probes never see each other's ClientHello.
#[derive(Debug, Clone)]
pub struct SniExtractor {
    config: Arc<ServerConfig>,
}

impl SniExtractor {
    pub fn new(tls: TlsConfigFactory) -> Result<Self, ConfigError> {
        let resolver = Arc::new(HelloRecorder::new(tls.placeholder()));
        let config = tls.server_config(resolver)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Probe `stream` for the server name the client asked for.
    ///
    /// Nothing is ever written to `stream`. Non-TLS traffic yields
    /// [`SniError::NotTls`]; the caller should drop such connections.
    pub async fn extract<S>(&self, stream: &mut S) -> Result<SniProbe, SniError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let slot = Arc::new(HelloSlot::default());
        let acceptor = TlsAcceptor::from(Arc::clone(&self.config));

        let handshake = HELLO
            .scope(
                Arc::clone(&slot),
                acceptor.accept(ReadOnlyStream::new(stream)).into_fallible(),
            )
            .await;

        let (outcome, bytes_read) = match handshake {
            Ok(tls) => {
                let (io, _) = tls.into_inner();
                (ProbeOutcome::Completed, io.into_parts().1)
            }
            // Only a refused write after the ClientHello was seen counts as
            // success; rustls may also try to write an alert for garbage input.
            Err((err, io)) if AttemptedWrite::is(&err) && slot.seen() => {
                (ProbeOutcome::Intercepted, io.into_parts().1)
            }
            Err((err, io)) => {
                debug!(
                    error = %err,
                    bytes_read = io.bytes_read().len(),
                    "Decoy handshake failed"
                );
                return Err(SniError::NotTls(err));
            }
        };

        let server_name = slot.server_name().map(normalize_server_name);
        Ok(SniProbe {
            server_name,
            bytes_read,
            outcome,
        })
    }
}

/// The ClientHello seen by one probe.
#[derive(Debug, Default)]
struct HelloSlot {
    hello: OnceLock<Option<String>>,
}

impl HelloSlot {
    fn seen(&self) -> bool {
        self.hello.get().is_some()
    }

    fn server_name(&self) -> Option<&str> {
        self.hello.get().and_then(|name| name.as_deref())
    }
}

/// Certificate resolver that records each ClientHello in the probing task's slot.
#[derive(Debug)]
struct HelloRecorder {
    placeholder: Arc<CertifiedKey>,
}

impl HelloRecorder {
    fn new(placeholder: Arc<CertifiedKey>) -> Self {
        Self { placeholder }
    }
}

impl ResolvesServerCert for HelloRecorder {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().map(str::to_string);
        // Outside a probe there is no slot; the handshake is refused anyway.
        let _ = HELLO.try_with(|slot| {
            let _ = slot.hello.set(server_name);
        });
        Some(Arc::clone(&self.placeholder))
    }
}
