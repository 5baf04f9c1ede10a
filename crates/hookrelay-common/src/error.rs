use std::time::Duration;

use hookrelay_protocol::{CodecError, DecodeError};
use thiserror::Error;

/// Errors raised while establishing or using the tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Bad or missing bearer token; rejected before any state changes
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("No tunnel client connected")]
    NoClientConnected,

    /// Read or write failure on the shared connection
    #[error("Tunnel transport error: {0}")]
    Transport(String),

    #[error("No response from tunnel client within {0:?}")]
    ForwardTimeout(Duration),

    /// Malformed frame; the connection that produced it is poisoned
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The tunnel client could not reach its local target
    #[error("Local call failed: {0}")]
    LocalCall(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport(reason.to_string())
    }

    /// HTTP status reported to a relay caller for this error
    pub fn status_code(&self) -> u16 {
        match self {
            TunnelError::Auth(_) => 401,
            TunnelError::ForwardTimeout(_) => 504,
            TunnelError::NoClientConnected
            | TunnelError::Transport(_)
            | TunnelError::Decode(_) => 502,
            _ => 500,
        }
    }

    /// Whether this error means the shared connection can no longer be used
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            TunnelError::Transport(_) | TunnelError::Decode(_) | TunnelError::Io(_)
        )
    }
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(e) => TunnelError::Decode(e),
            CodecError::Io(e) => TunnelError::Transport(e.to_string()),
            other => TunnelError::Transport(other.to_string()),
        }
    }
}
