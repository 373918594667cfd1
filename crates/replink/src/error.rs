//! Error types for the client crate

use replink_protocol::ProtocolError;
use replink_transport::TransportError;
use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while operating the shared port
#[derive(Debug, Error)]
pub enum ClientError {
    /// No transport is currently open on the arbiter
    #[error("no port is open")]
    NotConnected,

    /// Protocol-level failure from the raw-REPL driver
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local filesystem failure (the host side of get/put/run)
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether this wraps a negative filesystem lookup on the device
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Protocol(p) if p.is_not_found())
    }
}
