//! Read-only stream adapter.
//!
//! Wraps a connection so that a TLS server implementation can be run against
//! it without ever sending anything back to the peer. Every byte read is kept
//! so it can be replayed to the real destination, and every write fails with
//! [`AttemptedWrite`] without touching the inner stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Returned by every write on a [`ReadOnlyStream`].
///
/// Seeing this from a TLS server means it parsed the ClientHello and wanted
/// to answer it.
#[derive(Debug, Clone, Copy, Error)]
#[error("attempted write on read-only connection")]
pub struct AttemptedWrite;

impl AttemptedWrite {
    fn io_error() -> io::Error {
        io::Error::other(AttemptedWrite)
    }

    /// Check whether an I/O error is the read-only sentinel.
    pub fn is(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<AttemptedWrite>())
    }
}

/// A stream that records reads and refuses writes.
#[derive(Debug)]
pub struct ReadOnlyStream<S> {
    inner: S,
    read: Vec<u8>,
}

impl<S> ReadOnlyStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read: Vec::new(),
        }
    }

    /// All bytes read through this adapter so far, in order.
    pub fn bytes_read(&self) -> &[u8] {
        &self.read
    }

    /// Split into the inner stream and the bytes read from it.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.inner, self.read)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReadOnlyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: Unpin> AsyncWrite for ReadOnlyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(AttemptedWrite::io_error()))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(AttemptedWrite::io_error()))
    }

    // Nothing is ever buffered for the inner stream.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
