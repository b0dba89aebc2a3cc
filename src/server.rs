//! The connection acceptor.
//!
//! [`serve`] accepts connections until the shutdown token is cancelled or
//! the listener reports that it is closed, handing each one to its own task.
//! It returns only once every handler it started has finished.

use crate::error::{Error, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A source of incoming connections.
pub trait Listener: Send + 'static {
    type Conn: Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Speaks the wire protocol on one accepted connection.
///
/// `shutdown` is cancelled when the daemon starts exiting; handlers should
/// finish the request in hand and return.
pub trait ConnectionHandler<C>: Send + Sync + 'static {
    fn handle(
        &self,
        conn: C,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Retry after yielding
    Transient,
    /// The listener is gone; stop accepting
    Closed,
    Fatal,
}

fn classify(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptFailure::Transient,
        _ => match e.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                AcceptFailure::Transient
            }
            Some(libc::EBADF | libc::EINVAL) => AcceptFailure::Closed,
            _ => AcceptFailure::Fatal,
        },
    }
}

/// Accept connections and dispatch each to `handler` on its own task.
///
/// Cancelling `shutdown` stops the loop and drops the listener. Transient
/// accept failures are logged and retried; a listener that reports itself
/// closed ends the loop normally; anything else ends it with
/// [`Error::Accept`]. In every case the call waits for all dispatched
/// handlers before returning.
pub async fn serve<L, H>(mut listener: L, handler: Arc<H>, shutdown: CancellationToken) -> Result<()>
where
    L: Listener,
    H: ConnectionHandler<L::Conn>,
{
    let addr = listener.local_addr().ok();
    info!(addr = ?addr, "TCP: listening");

    let tracker = TaskTracker::new();
    let result = loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((conn, peer)) => {
                debug!(peer = %peer, "TCP: new client");
                let handler = handler.clone();
                let token = shutdown.clone();
                tracker.spawn(async move {
                    handler.handle(conn, peer, token).await;
                });
            }
            Err(e) => match classify(&e) {
                AcceptFailure::Transient => {
                    warn!(error = %e, "temporary accept failure");
                    tokio::task::yield_now().await;
                }
                AcceptFailure::Closed => {
                    debug!(error = %e, "listener closed");
                    break Ok(());
                }
                AcceptFailure::Fatal => break Err(Error::Accept(e)),
            },
        }
    };
    drop(listener);

    tracker.close();
    if !tracker.is_empty() {
        info!(handlers = tracker.len(), "TCP: waiting for handlers to finish");
    }
    tracker.wait().await;
    info!(addr = ?addr, "TCP: closing");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ScriptedListener {
        rx: mpsc::UnboundedReceiver<io::Result<u32>>,
    }

    impl Listener for ScriptedListener {
        type Conn = u32;

        fn accept(&mut self) -> impl Future<Output = io::Result<(u32, SocketAddr)>> + Send {
            async move {
                match self.rx.recv().await {
                    Some(Ok(conn)) => Ok((conn, SocketAddr::from(([127, 0, 0, 1], 9000)))),
                    Some(Err(e)) => Err(e),
                    None => Err(io::Error::from_raw_os_error(libc::EBADF)),
                }
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 4150)))
        }
    }

    #[derive(Default)]
    struct GatedHandler {
        release: CancellationToken,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConnectionHandler<u32> for GatedHandler {
        fn handle(
            &self,
            _conn: u32,
            _peer: SocketAddr,
            _shutdown: CancellationToken,
        ) -> impl Future<Output = ()> + Send {
            async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                self.release.cancelled().await;
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn scripted() -> (mpsc::UnboundedSender<io::Result<u32>>, ScriptedListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ScriptedListener { rx })
    }

    async fn wait_for(count: &AtomicUsize, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_classify() {
        let kind = |k: io::ErrorKind| io::Error::from(k);
        assert_eq!(classify(&kind(io::ErrorKind::ConnectionAborted)), AcceptFailure::Transient);
        assert_eq!(classify(&kind(io::ErrorKind::Interrupted)), AcceptFailure::Transient);
        assert_eq!(
            classify(&io::Error::from_raw_os_error(libc::EMFILE)),
            AcceptFailure::Transient
        );
        assert_eq!(
            classify(&io::Error::from_raw_os_error(libc::EBADF)),
            AcceptFailure::Closed
        );
        assert_eq!(classify(&kind(io::ErrorKind::PermissionDenied)), AcceptFailure::Fatal);
    }

    #[tokio::test]
    async fn test_waits_for_handlers_after_shutdown() {
        let (tx, listener) = scripted();
        let handler = Arc::new(GatedHandler::default());
        let shutdown = CancellationToken::new();
        let served = tokio::spawn(serve(listener, handler.clone(), shutdown.clone()));

        for conn in 0..3 {
            tx.send(Ok(conn)).unwrap();
        }
        wait_for(&handler.started, 3).await;

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!served.is_finished());
        assert_eq!(handler.finished.load(Ordering::SeqCst), 0);

        handler.release.cancel();
        served.await.unwrap().unwrap();
        assert_eq!(handler.finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_stop_the_loop() {
        let (tx, listener) = scripted();
        let handler = Arc::new(GatedHandler::default());
        handler.release.cancel();
        let served = tokio::spawn(serve(listener, handler.clone(), CancellationToken::new()));

        tx.send(Err(io::ErrorKind::ConnectionAborted.into())).unwrap();
        tx.send(Err(io::Error::from_raw_os_error(libc::EMFILE))).unwrap();
        tx.send(Ok(7)).unwrap();
        drop(tx);

        served.await.unwrap().unwrap();
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_is_returned_after_draining() {
        let (tx, listener) = scripted();
        let handler = Arc::new(GatedHandler::default());
        let served = tokio::spawn(serve(listener, handler.clone(), CancellationToken::new()));

        tx.send(Ok(1)).unwrap();
        wait_for(&handler.started, 1).await;
        tx.send(Err(io::ErrorKind::PermissionDenied.into())).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!served.is_finished());
        handler.release.cancel();

        assert!(matches!(served.await.unwrap(), Err(Error::Accept(_))));
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
    }
}
