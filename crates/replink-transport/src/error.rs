//! Transport error types

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the underlying channel failed
    #[error("failed to open {device}: {reason}")]
    OpenFailed {
        /// Connection string of the channel that could not be opened
        device: String,
        /// Why the open failed
        reason: String,
    },

    /// Connection-level error (login failure, peer gone)
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error on the underlying channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been closed and cannot accept writes
    #[error("transport closed")]
    Closed,

    /// Process error (for subprocess and PTY transports)
    #[error("process error: {0}")]
    Process(String),
}

impl TransportError {
    /// Create an `OpenFailed` error
    pub fn open_failed(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OpenFailed {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Create a `Connection` error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a `Process` error
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }
}
