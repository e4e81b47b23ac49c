// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - Forwarder
// One-direction byte relay between two halves of a forwarding pair

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Size of the per-direction copy buffer
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on flushing/shutting down a destination once the pair ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Any byte stream that can be forwarded (TCP socket, SSH channel, test pipe)
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased stream
pub type BoxedStream = Box<dyn TunnelStream>;

/// How a relay direction ended
#[derive(Debug)]
pub enum RelayEnd {
    /// Source reached end-of-stream
    Eof,
    /// The other direction of the pair ended first
    Cancelled,
    /// Reading or writing failed
    Failed(io::Error),
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes: u64,
    pub end: RelayEnd,
}

/// Copy bytes from `source` to `destination` until `source` hits EOF, either
/// side errors, or `pair` is cancelled by the opposite direction.
///
/// Whatever ends the copy also cancels `pair`, so the opposite direction
/// stops too; the destination is shut down and both halves are dropped
/// before returning. Errors are not propagated, only recorded in the outcome.
pub async fn relay<R, W>(mut source: R, mut destination: W, pair: CancellationToken) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let read = tokio::select! {
            biased;
            _ = pair.cancelled() => break RelayEnd::Cancelled,
            read = source.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break RelayEnd::Eof,
            Ok(n) => n,
            Err(e) => break RelayEnd::Failed(e),
        };

        let written = tokio::select! {
            biased;
            _ = pair.cancelled() => break RelayEnd::Cancelled,
            written = destination.write_all(&buf[..n]) => written,
        };

        if let Err(e) = written {
            break RelayEnd::Failed(e);
        }
        bytes += n as u64;
    };

    // Either direction ending tears down the whole pair
    pair.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, destination.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Shutdown of relay destination failed: {}", e),
        Err(_) => debug!("Shutdown of relay destination timed out after {:?}", SHUTDOWN_GRACE),
    }
    drop(destination);
    drop(source);

    RelayOutcome { bytes, end }
}
