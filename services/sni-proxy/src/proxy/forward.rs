//! Bidirectional byte forwarding.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 8192;

/// Byte counts for one forwarded connection pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
}

/// Splice `a` and `b` together until either side closes.
///
/// As soon as one direction ends (EOF or error) the other direction is
/// stopped and both streams are shut down and dropped. Returns only once
/// both directions have stopped.
pub async fn forward<A, B>(a: A, b: B) -> ForwardStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut stats = ForwardStats::default();

    {
        let a_to_b = copy_counted(&mut a_read, &mut b_write, &mut stats.a_to_b);
        let b_to_a = copy_counted(&mut b_read, &mut a_write, &mut stats.b_to_a);

        tokio::select! {
            result = a_to_b => log_direction("a_to_b", result),
            result = b_to_a => log_direction("b_to_a", result),
        }
    }

    // Best effort: the peer may already be gone.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    stats
}

fn log_direction(direction: &'static str, result: io::Result<()>) {
    match result {
        Ok(()) => debug!(direction, "Forwarding ended on EOF"),
        Err(e) => debug!(direction, error = %e, "Forwarding ended on error"),
    }
}

/// Copy until EOF, counting bytes into `total` as they are written.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
