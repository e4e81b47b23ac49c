// Reverse Tunnel - Secure Session
// Authenticated SSH session abstraction and the credentials used to open it

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reverse_tunnel_common::{HostPort, TunnelRequest};
use russh::keys::{decode_secret_key, PrivateKey};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Result, TunnelError};
use crate::listener::RemoteListener;

/// Credential presented to the SSH server
#[derive(Clone)]
pub enum AuthMethod {
    Password(Zeroizing<String>),
    PrivateKey(Arc<PrivateKey>),
}

impl AuthMethod {
    /// Pick the credential carried by `request`, decoding key material.
    ///
    /// A key is preferred if both are present; `TunnelRequest::validate`
    /// rejects that combination before we get here.
    pub fn from_request(request: &TunnelRequest) -> Result<Self> {
        if let Some(key) = &request.private_key {
            let passphrase = key.passphrase.as_ref().map(|p| p.as_str());
            let decoded = decode_secret_key(&key.contents, passphrase).map_err(|e| {
                TunnelError::Validation(format!("unable to load {}: {}", key.describe(), e))
            })?;
            return Ok(AuthMethod::PrivateKey(Arc::new(decoded)));
        }

        match &request.password {
            Some(password) if !password.is_empty() => Ok(AuthMethod::Password(password.clone())),
            _ => Err(TunnelError::Validation(
                "either a password or a private key is required".to_string(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey(_) => "publickey",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PrivateKey(key) => write!(f, "PrivateKey({})", key.algorithm()),
        }
    }
}

/// Whether PEM/OpenSSH key text needs a passphrase to decode
pub fn key_requires_passphrase(contents: &str) -> bool {
    // Try to decode without a passphrase; failure usually means encrypted
    decode_secret_key(contents, None).is_err()
}

/// Opens authenticated sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, verify the server and authenticate.
    ///
    /// Rejected credentials or host keys map to `TunnelError::Auth`;
    /// unreachable hosts and handshake failures to `TunnelError::Network`.
    async fn connect(
        &self,
        remote: &HostPort,
        user: &str,
        auth: &AuthMethod,
    ) -> Result<Box<dyn SecureSession>>;
}

/// An authenticated session able to open listeners on the server
#[async_trait]
pub trait SecureSession: Send + Sync {
    /// Ask the server to listen on `bind` and forward connections back.
    ///
    /// Fails with `TunnelError::Listen` if the server refuses the bind and
    /// with `TunnelError::Closed` once the session is closed.
    async fn listen_on_remote(&mut self, bind: &HostPort) -> Result<RemoteListener>;

    /// Tear down the session; listeners created from it stop accepting.
    /// Idempotent.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// `Connector::connect` bounded by `timeout`
pub async fn connect(
    connector: &dyn Connector,
    remote: &HostPort,
    user: &str,
    auth: &AuthMethod,
    timeout: Duration,
) -> Result<Box<dyn SecureSession>> {
    debug!("Opening secure session to {} as {} ({})", remote, user, auth.name());
    match tokio::time::timeout(timeout, connector.connect(remote, user, auth)).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::Network(format!(
            "connection to {} timed out after {}s",
            remote,
            timeout.as_secs()
        ))),
    }
}
