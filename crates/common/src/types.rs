// Common types for Reverse Tunnel

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::network::HostPort;

/// Default SSH port used when the remote address omits one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Private key text (OpenSSH or PEM) plus its optional passphrase.
///
/// The text is parsed by the core crate before any connection is made.
#[derive(Clone)]
pub struct KeyMaterial {
    pub contents: Zeroizing<String>,
    pub passphrase: Option<Zeroizing<String>>,
    /// Where the key came from, for messages only
    pub source: Option<PathBuf>,
}

impl KeyMaterial {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: Zeroizing::new(contents.into()),
            passphrase: None,
            source: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Human-readable label ("key file ~/.ssh/id_ed25519" or "inline key")
    pub fn describe(&self) -> String {
        match &self.source {
            Some(path) => format!("key file {}", path.display()),
            None => "inline key".to_string(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("source", &self.source)
            .field("has_passphrase", &self.passphrase.is_some())
            .finish()
    }
}

/// One tunnel attempt, as produced by an entry surface (CLI flags, saved config)
#[derive(Clone)]
pub struct TunnelRequest {
    /// SSH server address ("relay.example:22"; the port defaults to 22)
    pub remote_address: String,
    /// SSH username
    pub user: String,
    /// Password credential (mutually exclusive with `private_key`)
    pub password: Option<Zeroizing<String>>,
    /// Key credential (mutually exclusive with `password`)
    pub private_key: Option<KeyMaterial>,
    /// Interface and port the SSH server should listen on ("0.0.0.0:3000")
    pub remote_bind: String,
    /// Local service every accepted connection is forwarded to
    pub local_address: String,
}

impl fmt::Debug for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRequest")
            .field("remote_address", &self.remote_address)
            .field("user", &self.user)
            .field("has_password", &self.password.is_some())
            .field("private_key", &self.private_key)
            .field("remote_bind", &self.remote_bind)
            .field("local_address", &self.local_address)
            .finish()
    }
}

/// Which credential a validated request carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    PrivateKey,
}

/// Parsed endpoints of a request that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub remote: HostPort,
    pub bind: HostPort,
    pub local: HostPort,
    pub credential: CredentialKind,
}

impl TunnelRequest {
    /// Validate the request and parse its endpoints.
    /// Performs no I/O.
    pub fn validate(&self) -> Result<TunnelTarget> {
        if self.remote_address.trim().is_empty() {
            return Err(Error::Validation("Remote address cannot be empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Validation("User cannot be empty".to_string()));
        }
        if self.remote_bind.trim().is_empty() {
            return Err(Error::Validation("Remote bind address cannot be empty".to_string()));
        }
        if self.local_address.trim().is_empty() {
            return Err(Error::Validation("Local address cannot be empty".to_string()));
        }

        let credential = match (&self.password, &self.private_key) {
            (Some(_), Some(_)) => {
                return Err(Error::Validation(
                    "Password and private key are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Validation(
                    "Either a password or a private key is required".to_string(),
                ))
            }
            (Some(password), None) => {
                if password.is_empty() {
                    return Err(Error::Validation("Password cannot be empty".to_string()));
                }
                CredentialKind::Password
            }
            (None, Some(key)) => {
                if key.contents.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "Private key is empty ({})",
                        key.describe()
                    )));
                }
                CredentialKind::PrivateKey
            }
        };

        let remote = parse_remote_address(&self.remote_address)?;
        let bind: HostPort = self
            .remote_bind
            .parse()
            .map_err(|e| Error::Validation(format!("Remote bind address {}", detail(e))))?;
        let local: HostPort = self
            .local_address
            .parse()
            .map_err(|e| Error::Validation(format!("Local address {}", detail(e))))?;

        if local.port() == 0 {
            return Err(Error::Validation("Local port must be greater than 0".to_string()));
        }

        Ok(TunnelTarget {
            remote,
            bind,
            local,
            credential,
        })
    }
}

/// Parse the SSH server address, defaulting the port to 22 when absent
fn parse_remote_address(address: &str) -> Result<HostPort> {
    let address = address.trim();
    let has_port = if address.starts_with('[') {
        address.contains("]:")
    } else {
        address.contains(':')
    };

    let remote = if has_port {
        address
            .parse::<HostPort>()
            .map_err(|e| Error::Validation(format!("Remote address {}", detail(e))))?
    } else {
        let host = address.trim_start_matches('[').trim_end_matches(']');
        format!("[{}]:{}", host, DEFAULT_SSH_PORT)
            .parse::<HostPort>()
            .map_err(|e| Error::Validation(format!("Remote address {}", detail(e))))?
    };

    if remote.port() == 0 {
        return Err(Error::Validation("Remote port must be greater than 0".to_string()));
    }
    Ok(remote)
}

fn detail(e: Error) -> String {
    match e {
        Error::Validation(msg) => msg,
        other => other.to_string(),
    }
}

/// Lifecycle of one tunnel run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,          // request not yet accepted
    Connecting,    // TCP + SSH handshake + authentication
    Authenticated, // transport up, no remote bind yet
    Listening,     // tcpip-forward requested
    Accepting,     // accept loop running
    Stopped,       // terminal
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Authenticated => "authenticated",
            TunnelState::Listening => "listening",
            TunnelState::Accepting => "accepting",
            TunnelState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
