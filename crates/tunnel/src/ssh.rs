// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Reverse Tunnel - SSH Transport
// russh-backed Connector/SecureSession with remote (tcpip-forward) listeners

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reverse_tunnel_common::HostPort;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::Channel;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::known_hosts::{HostKeyDecision, HostKeyPolicy};
use crate::listener::{
    incoming_channel, BindRelease, IncomingSender, PendingRemoteConnection, RemoteListener,
};
use crate::session::{AuthMethod, Connector, SecureSession};

/// Upper bound on disconnect / cancel-tcpip-forward during teardown
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport tuning for the SSH client
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub keepalive_interval: Duration,
    /// Missed keepalives before the connection is considered dead
    pub keepalive_max: usize,
    pub window_size: u32,
    pub maximum_packet_size: u32,
    pub nodelay: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_max: 3,
            window_size: 2 * 1024 * 1024,
            maximum_packet_size: 65535,
            nodelay: true,
        }
    }
}

impl SshOptions {
    fn client_config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.window_size = self.window_size;
        cfg.maximum_packet_size = self.maximum_packet_size;
        cfg.nodelay = self.nodelay;
        // keepalives to avoid idle connections dying silently
        cfg.keepalive_interval = Some(self.keepalive_interval);
        cfg.keepalive_max = self.keepalive_max;
        cfg
    }
}

/// Remote port -> listener feed, owned by the russh handler.
///
/// When the connection ends russh drops the handler, the map goes with it
/// and every listener sees its feed close.
#[derive(Default)]
struct ForwardRoutes {
    routes: StdMutex<HashMap<u32, IncomingSender>>,
}

impl ForwardRoutes {
    fn insert(&self, port: u32, sender: IncomingSender) {
        self.lock().insert(port, sender);
    }

    fn remove(&self, port: u32) {
        self.lock().remove(&port);
    }

    /// Move a route registered for port 0 to the port the server assigned
    fn rekey(&self, from: u32, to: u32) {
        let mut routes = self.lock();
        if let Some(sender) = routes.remove(&from) {
            routes.insert(to, sender);
        }
    }

    fn sender_for(&self, port: u32) -> Option<IncomingSender> {
        let routes = self.lock();
        routes.get(&port).or_else(|| routes.get(&0)).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, IncomingSender>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// SSH client handler: host key policy and forwarded channel routing
struct ClientHandler {
    remote: HostPort,
    host_keys: Arc<HostKeyPolicy>,
    routes: Arc<ForwardRoutes>,
    /// Why the host key was rejected, read back after a failed handshake
    rejection: Arc<StdMutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self
            .host_keys
            .check(self.remote.host(), self.remote.port(), server_public_key)
        {
            HostKeyDecision::Accept => Ok(true),
            HostKeyDecision::Reject(reason) => {
                warn!("Rejecting host key for {}: {}", self.remote, reason);
                *self
                    .rejection
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let origin = forwarded_origin(originator_address, originator_port);

        let Some(sender) = self.routes.sender_for(connected_port) else {
            warn!(
                "Refusing forwarded connection from {} for unknown bind {}:{}",
                origin, connected_address, connected_port
            );
            // Don't block the session loop on the close
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return Ok(());
        };

        debug!(
            "Forwarded connection from {} on {}:{}",
            origin, connected_address, connected_port
        );
        let pending = PendingRemoteConnection::new(Box::new(channel.into_stream()), origin);
        if let Err(rejected) = sender.send(Ok(pending)) {
            debug!("Listener for port {} is gone; dropping connection", connected_port);
            if let Ok(pending) = rejected.0 {
                tokio::spawn(pending.close());
            }
        }
        Ok(())
    }
}

/// "host:port" of the peer behind a forwarded channel, as the server reports it
fn forwarded_origin(address: &str, port: u32) -> String {
    match u16::try_from(port) {
        Ok(port) => reverse_tunnel_common::format_host_port(address, port),
        Err(_) => {
            warn!("Server reported out-of-range originator port {} for {}", port, address);
            address.to_string()
        }
    }
}

/// Opens `SshSession`s with russh
pub struct SshConnector {
    options: SshOptions,
    host_keys: Arc<HostKeyPolicy>,
}

impl SshConnector {
    pub fn new(options: SshOptions, host_keys: HostKeyPolicy) -> Self {
        Self {
            options,
            host_keys: Arc::new(host_keys),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        remote: &HostPort,
        user: &str,
        auth: &AuthMethod,
    ) -> Result<Box<dyn SecureSession>> {
        let config = Arc::new(self.options.client_config());
        let routes = Arc::new(ForwardRoutes::default());
        let rejection = Arc::new(StdMutex::new(None));

        let handler = ClientHandler {
            remote: remote.clone(),
            host_keys: self.host_keys.clone(),
            routes: routes.clone(),
            rejection: rejection.clone(),
        };
        let weak_routes = Arc::downgrade(&routes);
        // The handler owns the routes from here on
        drop(routes);

        let addr = remote.to_string();
        info!("Connecting to SSH server: {}", addr);

        let mut handle = match client::connect(config, addr.as_str(), handler).await {
            Ok(handle) => handle,
            Err(e) => {
                let rejected = rejection
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                return Err(match rejected {
                    Some(reason) => TunnelError::Auth(format!("host key rejected: {}", reason)),
                    None => TunnelError::Network(format!("failed to connect to {}: {}", addr, e)),
                });
            }
        };

        if let Err(e) = authenticate(&mut handle, user, auth).await {
            if let Err(err) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("Failed to disconnect after auth failure: {}", err);
            }
            return Err(e);
        }

        info!("SSH authentication successful for {}@{}", user, addr);

        Ok(Box::new(SshSession {
            handle: Arc::new(Mutex::new(handle)),
            routes: weak_routes,
            closed: CancellationToken::new(),
            remote: remote.clone(),
        }))
    }
}

/// Run one authentication attempt with the given credential
async fn authenticate(handle: &mut Handle<ClientHandler>, user: &str, auth: &AuthMethod) -> Result<()> {
    let result = match auth {
        AuthMethod::Password(password) => handle
            .authenticate_password(user, password.as_str())
            .await
            .map_err(|e| TunnelError::Network(format!("password authentication failed: {}", e)))?,
        AuthMethod::PrivateKey(key) => {
            // Non-RSA keys ignore the hash algorithm
            let rsa_hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| TunnelError::Network(e.to_string()))?
                .flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), rsa_hash))
                .await
                .map_err(|e| TunnelError::Network(format!("public key authentication failed: {}", e)))?
        }
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();

            let detail = if partial_success {
                format!("server requires additional authentication: {}", methods.join(", "))
            } else if methods.is_empty() {
                "no authentication methods available".to_string()
            } else {
                format!("server allows: {}", methods.join(", "))
            };
            Err(TunnelError::Auth(format!(
                "{} authentication rejected for user {} ({})",
                auth.name(),
                user,
                detail
            )))
        }
    }
}

/// Authenticated russh connection
pub struct SshSession {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    routes: Weak<ForwardRoutes>,
    closed: CancellationToken,
    remote: HostPort,
}

#[async_trait]
impl SecureSession for SshSession {
    async fn listen_on_remote(&mut self, bind: &HostPort) -> Result<RemoteListener> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let routes = self.routes.upgrade().ok_or_else(|| {
            TunnelError::Network(format!("connection to {} was lost", self.remote))
        })?;

        let requested = u32::from(bind.port());
        let (tx, rx) = incoming_channel();
        // Register before asking so no early channel is refused
        routes.insert(requested, tx);

        let forwarded = {
            let mut handle = self.handle.lock().await;
            handle.tcpip_forward(bind.host().to_string(), requested).await
        };

        let assigned = match forwarded {
            Ok(assigned) => assigned,
            Err(e) => {
                routes.remove(requested);
                return Err(match e {
                    russh::Error::RequestDenied => TunnelError::Listen(format!(
                        "server refused to listen on {} (port in use or server policy)",
                        bind
                    )),
                    other => TunnelError::Listen(format!("tcpip-forward for {} failed: {}", bind, other)),
                });
            }
        };

        // Servers only report a port when we asked for 0
        let port = if requested == 0 && assigned != 0 {
            routes.rekey(requested, assigned);
            assigned
        } else {
            requested
        };
        let effective = match u16::try_from(port) {
            Ok(port) => bind.with_port(port),
            Err(_) => {
                warn!("Server assigned out-of-range port {} for {}", port, bind);
                bind.clone()
            }
        };

        info!("Remote forward active on {} via {}", effective, self.remote);

        Ok(RemoteListener::new(
            effective,
            rx,
            self.closed.child_token(),
            Some(Box::new(SshBindRelease {
                handle: self.handle.clone(),
                routes: self.routes.clone(),
                port,
            })),
        ))
    }

    async fn close(&mut self) {
        if self.closed.is_cancelled() {
            debug!("SSH session to {} already closed", self.remote);
            return;
        }
        self.closed.cancel();

        let handle = self.handle.lock().await;
        match tokio::time::timeout(
            TEARDOWN_TIMEOUT,
            handle.disconnect(russh::Disconnect::ByApplication, "", "en"),
        )
        .await
        {
            Ok(Ok(())) => debug!("Disconnected from {}", self.remote),
            Ok(Err(e)) => debug!("Failed to disconnect gracefully: {}", e),
            Err(_) => debug!("Disconnect from {} timed out", self.remote),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.routes.strong_count() == 0
    }
}

/// Sends cancel-tcpip-forward for a listener's bind
struct SshBindRelease {
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    routes: Weak<ForwardRoutes>,
    port: u32,
}

#[async_trait]
impl BindRelease for SshBindRelease {
    async fn release(&self, bind: &HostPort) {
        let Some(routes) = self.routes.upgrade() else {
            debug!("Connection gone; nothing to release for {}", bind);
            return;
        };
        routes.remove(self.port);

        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return;
        }
        match tokio::time::timeout(
            TEARDOWN_TIMEOUT,
            handle.cancel_tcpip_forward(bind.host().to_string(), self.port),
        )
        .await
        {
            Ok(Ok(())) => debug!("Released remote bind {}", bind),
            Ok(Err(e)) => warn!("Failed to release remote bind {}: {}", bind, e),
            Err(_) => warn!("Releasing remote bind {} timed out", bind),
        }
    }
}
