//! Connection-injection listener.
//!
//! A listener fed programmatically instead of by a socket. It lets the proxy
//! sit behind another connection source (a tunnel multiplexer, a TCP accept
//! loop with its own policy, a test) without a real socket at that boundary.
//!
//! ```ignore
//! let (injector, listener) = inject::channel();
//! tokio::spawn(async move { proxy.listen_and_proxy(listener).await });
//! injector.send(conn).await?;
//! injector.close();
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use super::accept::Accept;

/// Error reported by [`InjectListener::accept`] once the listener is closed.
#[derive(Debug, Clone, Copy, Error)]
#[error("listener closed")]
pub struct ListenerClosed;

impl ListenerClosed {
    /// Check whether an accept error means the listener was closed.
    pub fn is(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<ListenerClosed>())
    }

    fn io_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, ListenerClosed)
    }
}

/// A connection handed back because the listener was closed.
#[derive(Error)]
#[error("listener closed")]
pub struct SendError<C>(pub C);

impl<C> fmt::Debug for SendError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

/// Create a connected injector/listener pair.
pub fn channel<C>() -> (Injector<C>, InjectListener<C>) {
    let (tx, rx) = mpsc::channel(1);
    let closed = Arc::new(watch::Sender::new(false));

    (
        Injector {
            tx,
            closed: Arc::clone(&closed),
        },
        InjectListener { rx, closed },
    )
}

/// Sending side: pushes connections into an [`InjectListener`].
pub struct Injector<C> {
    tx: mpsc::Sender<C>,
    closed: Arc<watch::Sender<bool>>,
}

impl<C> Clone for Injector<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<C> Injector<C> {
    /// Hand a connection to the listener.
    ///
    /// Waits until the listener has room for it. If the listener is closed
    /// first, the connection is returned in the error.
    pub async fn send(&self, conn: C) -> Result<(), SendError<C>> {
        if self.is_closed() {
            return Err(SendError(conn));
        }

        let mut closed = self.closed.subscribe();
        tokio::select! {
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(conn);
                    Ok(())
                }
                Err(_) => Err(SendError(conn)),
            },
            _ = wait_closed(&mut closed) => Err(SendError(conn)),
        }
    }

    /// Close the listener. Pending and future accepts fail with [`ListenerClosed`].
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }
}

/// Receiving side: hands injected connections to whoever accepts.
pub struct InjectListener<C> {
    rx: mpsc::Receiver<C>,
    closed: Arc<watch::Sender<bool>>,
}

impl<C> InjectListener<C> {
    /// Close the listener from the accepting side.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Wait for the next injected connection.
    ///
    /// Fails with [`ListenerClosed`] once the listener is closed or every
    /// [`Injector`] has been dropped.
    pub async fn next(&mut self) -> io::Result<C> {
        let mut closed = self.closed.subscribe();
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return Err(ListenerClosed::io_error());
        }

        tokio::select! {
            conn = self.rx.recv() => conn.ok_or_else(ListenerClosed::io_error),
            _ = wait_closed(&mut closed) => Err(ListenerClosed::io_error()),
        }
    }
}

impl<C> Drop for InjectListener<C> {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

/// Resolve once the closed flag is set.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl<C> Accept for InjectListener<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Conn = C;

    async fn accept(&mut self) -> io::Result<C> {
        self.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_then_accept() {
        let (injector, mut listener) = channel::<u32>();

        tokio::spawn(async move {
            injector.send(1).await.unwrap();
            injector.send(2).await.unwrap();
        });

        assert_eq!(listener.next().await.unwrap(), 1);
        assert_eq!(listener.next().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (injector, mut listener) = channel::<u32>();

        let accept = tokio::spawn(async move { listener.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        injector.close();

        let err = timeout(Duration::from_secs(1), accept)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(ListenerClosed::is(&err));
    }

    #[tokio::test]
    async fn test_send_after_close_returns_connection() {
        let (injector, listener) = channel::<u32>();
        listener.close();

        assert!(injector.is_closed());
        let SendError(conn) = injector.send(7).await.unwrap_err();
        assert_eq!(conn, 7);
    }

    #[tokio::test]
    async fn test_blocked_send_fails_on_close() {
        let (injector, mut listener) = channel::<u32>();

        // Fill the single slot so the next send has to wait.
        injector.send(1).await.unwrap();
        let blocked = {
            let injector = injector.clone();
            tokio::spawn(async move { injector.send(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        listener.close();
        let SendError(conn) = timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(conn, 2);
        assert!(listener.next().await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_injectors_closes() {
        let (injector, mut listener) = channel::<u32>();
        drop(injector);

        let err = listener.next().await.unwrap_err();
        assert!(ListenerClosed::is(&err));
    }

    #[tokio::test]
    async fn test_accept_trait() {
        let (injector, mut listener) = channel();
        let (a, _b) = tokio::io::duplex(16);

        injector.send(a).await.unwrap();
        assert!(Accept::accept(&mut listener).await.is_ok());
    }
}
