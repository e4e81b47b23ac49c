// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - Remote Listener
// Accept loop source for connections the SSH server forwards back to us

use std::fmt;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use reverse_tunnel_common::HostPort;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AcceptError;
use crate::forwarder::BoxedStream;

/// Upper bound on closing a connection we decided not to serve
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One inbound stream accepted on the remote side, not yet paired
pub struct PendingRemoteConnection {
    stream: BoxedStream,
    origin: String,
}

impl PendingRemoteConnection {
    pub fn new(stream: BoxedStream, origin: impl Into<String>) -> Self {
        Self {
            stream,
            origin: origin.into(),
        }
    }

    /// Address of the client that connected to the remote listener
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }

    /// Close without reading anything; the remote client sees the
    /// connection end.
    pub async fn close(mut self) {
        match tokio::time::timeout(CLOSE_GRACE, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing connection from {} failed: {}", self.origin, e),
            Err(_) => debug!("Closing connection from {} timed out", self.origin),
        }
    }
}

impl fmt::Debug for PendingRemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRemoteConnection")
            .field("origin", &self.origin)
            .finish()
    }
}

/// What a transport pushes to its listener
pub type Incoming = Result<PendingRemoteConnection, AcceptError>;
pub type IncomingSender = mpsc::UnboundedSender<Incoming>;
pub type IncomingReceiver = mpsc::UnboundedReceiver<Incoming>;

/// Create the channel a transport uses to feed a `RemoteListener`.
///
/// When every sender is dropped the listener treats the transport as lost.
pub fn incoming_channel() -> (IncomingSender, IncomingReceiver) {
    mpsc::unbounded_channel()
}

/// Gives the remote bind back to the server (e.g. `cancel-tcpip-forward`)
#[async_trait]
pub trait BindRelease: Send + Sync {
    async fn release(&self, bind: &HostPort);
}

/// Handle for a listening socket the SSH server opened on our behalf
pub struct RemoteListener {
    bind: HostPort,
    incoming: Mutex<IncomingReceiver>,
    /// Cancelled by `close()` or by closing the parent session
    closed: CancellationToken,
    terminal: StdMutex<Option<AcceptError>>,
    release: StdMutex<Option<Box<dyn BindRelease>>>,
}

impl RemoteListener {
    /// `closed` should be a child token of the owning session so closing
    /// the session invalidates the listener.
    pub fn new(
        bind: HostPort,
        incoming: IncomingReceiver,
        closed: CancellationToken,
        release: Option<Box<dyn BindRelease>>,
    ) -> Self {
        Self {
            bind,
            incoming: Mutex::new(incoming),
            closed,
            terminal: StdMutex::new(None),
            release: StdMutex::new(release),
        }
    }

    /// The bind actually in effect (server-assigned port if 0 was requested)
    pub fn bind(&self) -> &HostPort {
        &self.bind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait for the next inbound connection.
    ///
    /// A recoverable error leaves the listener usable. A terminal error
    /// (transport lost, closed) is returned again by every later call.
    pub async fn accept_next(&self) -> Result<PendingRemoteConnection, AcceptError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        let mut incoming = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.mark_terminal(AcceptError::Closed)),
            guard = self.incoming.lock() => guard,
        };

        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.mark_terminal(AcceptError::Closed)),
            next = incoming.recv() => next,
        };

        match next {
            Some(Ok(connection)) => Ok(connection),
            Some(Err(err)) if err.is_terminal() => Err(self.mark_terminal(err)),
            Some(Err(err)) => Err(err),
            None => Err(self.mark_terminal(AcceptError::TransportLost(
                "connection to the SSH server ended".to_string(),
            ))),
        }
    }

    /// Stop accepting and release the remote bind. Idempotent.
    pub async fn close(&self) {
        self.closed.cancel();

        let release = self
            .release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match release {
            Some(release) => {
                debug!("Releasing remote bind {}", self.bind);
                release.release(&self.bind).await;
            }
            None => debug!("Remote listener {} already closed", self.bind),
        }
    }

    fn terminal_error(&self) -> Option<AcceptError> {
        if let Some(err) = self
            .terminal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Some(err);
        }
        if self.closed.is_cancelled() {
            return Some(self.mark_terminal(AcceptError::Closed));
        }
        None
    }

    /// Record the first terminal error; later ones report the first
    fn mark_terminal(&self, err: AcceptError) -> AcceptError {
        let mut terminal = self
            .terminal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        terminal.get_or_insert(err).clone()
    }
}

impl fmt::Debug for RemoteListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteListener")
            .field("bind", &self.bind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::duplex;

    struct CountingRelease(Arc<AtomicUsize>);

    #[async_trait]
    impl BindRelease for CountingRelease {
        async fn release(&self, _bind: &HostPort) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pending(origin: &str) -> PendingRemoteConnection {
        let (stream, _peer) = duplex(16);
        PendingRemoteConnection::new(Box::new(stream), origin)
    }

    fn listener() -> (RemoteListener, IncomingSender, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = incoming_channel();
        let listener = RemoteListener::new(
            HostPort::new("0.0.0.0", 9000),
            rx,
            CancellationToken::new(),
            Some(Box::new(CountingRelease(releases.clone()))),
        );
        (listener, tx, releases)
    }

    #[tokio::test]
    async fn test_accepts_in_sequence() {
        let (listener, tx, _) = listener();
        tx.send(Ok(pending("203.0.113.7:50000"))).unwrap();
        tx.send(Ok(pending("203.0.113.8:50001"))).unwrap();

        assert_eq!(listener.accept_next().await.unwrap().origin(), "203.0.113.7:50000");
        assert_eq!(listener.accept_next().await.unwrap().origin(), "203.0.113.8:50001");
    }

    #[tokio::test]
    async fn test_recoverable_error_keeps_listener_usable() {
        let (listener, tx, _) = listener();
        tx.send(Err(AcceptError::Recoverable("malformed channel".into())))
            .unwrap();
        tx.send(Ok(pending("203.0.113.7:50000"))).unwrap();

        assert_eq!(
            listener.accept_next().await.unwrap_err(),
            AcceptError::Recoverable("malformed channel".into())
        );
        assert!(listener.accept_next().await.is_ok());
    }

    #[tokio::test]
    async fn test_lost_transport_is_sticky() {
        let (listener, tx, _) = listener();
        drop(tx);

        let first = listener.accept_next().await.unwrap_err();
        assert!(matches!(first, AcceptError::TransportLost(_)));
        let second = listener.accept_next().await.unwrap_err();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let (listener, _tx, _) = listener();
        let listener = Arc::new(listener);

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("accept should unblock")
            .unwrap();
        assert_eq!(result.unwrap_err(), AcceptError::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, _tx, releases) = listener();
        listener.close().await;
        listener.close().await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(listener.accept_next().await.unwrap_err(), AcceptError::Closed);
    }

    #[tokio::test]
    async fn test_parent_token_cascades() {
        let session = CancellationToken::new();
        let (_tx, rx) = incoming_channel();
        let listener = RemoteListener::new(
            HostPort::new("0.0.0.0", 9000),
            rx,
            session.child_token(),
            None,
        );

        session.cancel();
        assert!(listener.is_closed());
        assert_eq!(listener.accept_next().await.unwrap_err(), AcceptError::Closed);
    }
}
