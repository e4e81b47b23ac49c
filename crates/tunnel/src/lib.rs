// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - Core Library
// Secure session, remote listener, connection pairing and the session manager

pub mod error;
pub mod forwarder;
pub mod known_hosts;
pub mod listener;
pub mod manager;
pub mod pairer;
pub mod session;
pub mod ssh;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{AcceptError, Result, TunnelError};
pub use forwarder::{relay, BoxedStream, RelayEnd, RelayOutcome, TunnelStream};
pub use known_hosts::{calculate_fingerprint, HostKeyDecision, HostKeyPolicy, KnownHosts};
pub use listener::{
    incoming_channel, BindRelease, Incoming, IncomingReceiver, IncomingSender,
    PendingRemoteConnection, RemoteListener,
};
pub use manager::{SessionOptions, TunnelHandle, TunnelSessionManager, DEFAULT_CONNECT_TIMEOUT};
pub use pairer::{ConnectionPairer, ForwardingPair, LocalDialer, TcpDialer};
pub use session::{connect, key_requires_passphrase, AuthMethod, Connector, SecureSession};
pub use ssh::{SshConnector, SshOptions, SshSession};
