// Error taxonomy for tunnel runs

use thiserror::Error;

/// Failure of a single `accept_next()` call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceptError {
    /// One inbound connection could not be accepted; the listener is still usable
    #[error("{0}")]
    Recoverable(String),

    /// The secure transport under the listener is gone
    #[error("secure transport lost: {0}")]
    TransportLost(String),

    /// The listener (or its session) was closed
    #[error("remote listener closed")]
    Closed,
}

impl AcceptError {
    /// Terminal errors repeat on every later `accept_next()` call
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AcceptError::Recoverable(_))
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid tunnel request: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote listener refused: {0}")]
    Listen(String),

    #[error("accept failed: {0}")]
    Accept(#[from] AcceptError),

    #[error("failed to connect to local service {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection from {origin} refused: {limit} forwarded connections already active")]
    Admission { origin: String, limit: usize },

    #[error("secure session is closed")]
    Closed,

    #[error("tunnel task failed: {0}")]
    Task(String),
}

impl TunnelError {
    /// Whether this error ends the whole tunnel run (vs. one connection)
    pub fn is_fatal(&self) -> bool {
        match self {
            TunnelError::Accept(e) => e.is_terminal(),
            TunnelError::Dial { .. } | TunnelError::Admission { .. } => false,
            _ => true,
        }
    }
}

impl From<reverse_tunnel_common::Error> for TunnelError {
    fn from(e: reverse_tunnel_common::Error) -> Self {
        match e {
            reverse_tunnel_common::Error::Validation(msg) => TunnelError::Validation(msg),
            other => TunnelError::Validation(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
