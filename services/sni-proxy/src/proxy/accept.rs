//! The "accept one connection at a time" abstraction.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A source of incoming byte-stream connections.
///
/// An error from [`Accept::accept`] is terminal: the proxy stops accepting
/// and shuts down when it sees one.
#[async_trait]
pub trait Accept: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<Self::Conn>;
}

#[async_trait]
impl Accept for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, peer_addr) = TcpListener::accept(self).await?;
        debug!(peer_addr = %peer_addr, "Accepted TCP connection");
        Ok(stream)
    }
}
