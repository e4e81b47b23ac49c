// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - Connection Pairer
// Dials the local service for each accepted remote connection and bridges the two

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reverse_tunnel_common::HostPort;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::forwarder::{relay, BoxedStream, RelayEnd, RelayOutcome};
use crate::listener::PendingRemoteConnection;

/// Opens connections to the local service
#[async_trait]
pub trait LocalDialer: Send + Sync {
    async fn dial(&self, address: &HostPort) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer with the platform's connect timeout
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl LocalDialer for TcpDialer {
    async fn dial(&self, address: &HostPort) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        // disable nagle for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        Ok(Box::new(stream))
    }
}

/// Turns accepted remote connections into forwarding pairs
pub struct ConnectionPairer {
    local: HostPort,
    dialer: Arc<dyn LocalDialer>,
    admission: Option<(Arc<Semaphore>, usize)>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl ConnectionPairer {
    pub fn new(local: HostPort, dialer: Arc<dyn LocalDialer>) -> Self {
        Self {
            local,
            dialer,
            admission: None,
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Cap the number of concurrently bridged connections (None = unlimited)
    pub fn with_limit(mut self, max_connections: Option<usize>) -> Self {
        self.admission = max_connections.map(|limit| (Arc::new(Semaphore::new(limit)), limit));
        self
    }

    pub fn local(&self) -> &HostPort {
        &self.local
    }

    /// Number of pairs whose copy tasks are still running
    pub fn active_pairs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Dial the local service and bridge it with `pending`.
    ///
    /// Returns as soon as both copy tasks are spawned. If the dial fails (or
    /// the admission limit is reached) `pending` is closed without being read.
    pub async fn pair(&self, pending: PendingRemoteConnection) -> Result<ForwardingPair> {
        let permit = match &self.admission {
            Some((semaphore, limit)) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let origin = pending.origin().to_string();
                    pending.close().await;
                    return Err(TunnelError::Admission {
                        origin,
                        limit: *limit,
                    });
                }
            },
            None => None,
        };

        let local_stream = match self.dialer.dial(&self.local).await {
            Ok(stream) => stream,
            Err(source) => {
                pending.close().await;
                return Err(TunnelError::Dial {
                    address: self.local.to_string(),
                    source,
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let origin = pending.origin().to_string();
        let lease = Arc::new(PairLease::new(id, origin.clone(), self.active.clone(), permit));

        let (remote_read, remote_write) = tokio::io::split(pending.into_stream());
        let (local_read, local_write) = tokio::io::split(local_stream);
        let token = CancellationToken::new();

        let inbound = tokio::spawn({
            let lease = lease.clone();
            let token = token.clone();
            async move {
                let outcome = relay(remote_read, local_write, token).await;
                debug!(
                    "Connection {} remote -> local ended after {} bytes: {:?}",
                    lease.id, outcome.bytes, outcome.end
                );
                outcome
            }
        });

        let outbound = tokio::spawn(async move {
            let outcome = relay(local_read, remote_write, token).await;
            debug!(
                "Connection {} local -> remote ended after {} bytes: {:?}",
                lease.id, outcome.bytes, outcome.end
            );
            outcome
        });

        debug!("Bridged connection {} from {} to {}", id, origin, self.local);

        Ok(ForwardingPair {
            id,
            origin,
            inbound,
            outbound,
        })
    }
}

/// Shared by both copy tasks of a pair; the last one to finish releases it
struct PairLease {
    id: u64,
    origin: String,
    active: Arc<AtomicUsize>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PairLease {
    fn new(
        id: u64,
        origin: String,
        active: Arc<AtomicUsize>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            origin,
            active,
            _permit: permit,
        }
    }
}

impl Drop for PairLease {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(
            "Connection {} from {} closed ({} still active)",
            self.id, self.origin, remaining
        );
    }
}

/// Two bridged streams and the two tasks copying between them
pub struct ForwardingPair {
    id: u64,
    origin: String,
    inbound: JoinHandle<RelayOutcome>,
    outbound: JoinHandle<RelayOutcome>,
}

impl ForwardingPair {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_finished(&self) -> bool {
        self.inbound.is_finished() && self.outbound.is_finished()
    }

    /// Wait for both copy tasks: (remote -> local, local -> remote)
    pub async fn join(self) -> (RelayOutcome, RelayOutcome) {
        (joined(self.inbound.await), joined(self.outbound.await))
    }
}

fn joined(result: std::result::Result<RelayOutcome, tokio::task::JoinError>) -> RelayOutcome {
    result.unwrap_or_else(|e| RelayOutcome {
        bytes: 0,
        end: RelayEnd::Failed(io::Error::new(io::ErrorKind::Other, e.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tracked_pair, ScriptedDialer};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local() -> HostPort {
        HostPort::new("127.0.0.1", 8080)
    }

    #[tokio::test]
    async fn test_pair_bridges_both_directions() {
        let (remote, mut remote_peer, _) = tracked_pair();
        let (local_stream, mut local_peer, _) = tracked_pair();
        let dialer = Arc::new(ScriptedDialer::new().then_connect(local_stream));
        let pairer = ConnectionPairer::new(local(), dialer.clone());

        let pair = pairer
            .pair(PendingRemoteConnection::new(Box::new(remote), "203.0.113.7:50000"))
            .await
            .unwrap();
        assert_eq!(pair.origin(), "203.0.113.7:50000");
        assert_eq!(dialer.calls(), 1);

        remote_peer.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");

        local_peer.write_all(b"HTTP/1.1 200 OK").await.unwrap();
        let mut buf = [0u8; 15];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200 OK");

        assert_eq!(pairer.active_pairs(), 1);
        drop(remote_peer);
        drop(local_peer);
        pair.join().await;
        assert_eq!(pairer.active_pairs(), 0);
    }

    #[tokio::test]
    async fn test_closing_one_side_closes_both() {
        let (remote, remote_peer, remote_closed) = tracked_pair();
        let (local_stream, local_peer, local_closed) = tracked_pair();
        let dialer = Arc::new(ScriptedDialer::new().then_connect(local_stream));
        let pairer = ConnectionPairer::new(local(), dialer);

        let pair = pairer
            .pair(PendingRemoteConnection::new(Box::new(remote), "203.0.113.7:50000"))
            .await
            .unwrap();

        // Only the local service hangs up; the remote client stays connected
        drop(local_peer);

        tokio::time::timeout(Duration::from_secs(2), pair.join())
            .await
            .expect("pair should wind down once one side closes");
        assert!(local_closed.is_closed());
        assert!(remote_closed.is_closed());
        drop(remote_peer);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_pending() {
        let (remote, mut remote_peer, remote_closed) = tracked_pair();
        let dialer = Arc::new(ScriptedDialer::new().then_refuse());
        let pairer = ConnectionPairer::new(local(), dialer);

        let err = pairer
            .pair(PendingRemoteConnection::new(Box::new(remote), "203.0.113.7:50000"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Dial { .. }));
        assert!(!err.is_fatal());
        assert!(remote_closed.is_closed());

        // The remote client sees the connection end
        let mut rest = Vec::new();
        remote_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(pairer.active_pairs(), 0);
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let (first, _first_peer, _) = tracked_pair();
        let (second, _second_peer, second_closed) = tracked_pair();
        let (local_stream, local_peer, _) = tracked_pair();
        let dialer = Arc::new(ScriptedDialer::new().then_connect(local_stream));
        let pairer = ConnectionPairer::new(local(), dialer.clone()).with_limit(Some(1));

        let pair = pairer
            .pair(PendingRemoteConnection::new(Box::new(first), "203.0.113.7:50000"))
            .await
            .unwrap();

        let err = pairer
            .pair(PendingRemoteConnection::new(Box::new(second), "203.0.113.8:50001"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Admission { limit: 1, .. }));
        assert!(second_closed.is_closed());
        assert_eq!(dialer.calls(), 1, "refused connections must not dial");

        drop(local_peer);
        pair.join().await;
        assert_eq!(pairer.active_pairs(), 0);
    }
}
