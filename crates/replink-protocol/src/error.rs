//! Error types for protocol operations
//!
//! Framing violations (bad handshake, desync, missing terminator) are
//! fatal to the in-flight operation; recovery requires a fresh
//! `enter_raw_repl` that only the caller can orchestrate. Remote program
//! errors and negative filesystem lookups are expected outcomes and get
//! their own non-fatal representations.

use crate::pyliteral::LiteralError;
use replink_transport::TransportError;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while driving the raw REPL
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The raw-REPL entry handshake did not produce the expected trailer
    #[error("could not enter raw repl")]
    EnterRawReplFailed,

    /// The device rejected a command (bad two-byte acknowledgment)
    #[error("could not exec command (response: {response:?})")]
    ExecFailed {
        /// The bytes the device sent instead of the expected ack
        response: Vec<u8>,
    },

    /// Protocol desync: the device sent something other than a window
    /// grant or an abort while a raw-paste transfer was in flight
    #[error("unexpected read during raw paste: 0x{0:02x}")]
    UnexpectedByteDuringPaste(u8),

    /// The device never acknowledged the end of a raw-paste transfer
    #[error("could not complete raw paste")]
    PasteCompletionTimeout,

    /// The device aborted a raw-paste transfer mid-flight; the partial
    /// transfer was acknowledged and the caller decides whether to retry
    #[error("device aborted raw paste transfer")]
    AbortedByDevice,

    /// The normal-output stream terminator never arrived; the transfer
    /// itself most likely crashed
    #[error("timeout waiting for first EOF reception")]
    TimeoutWaitingForFirstEof,

    /// The error-output stream terminator never arrived; the remote
    /// program most likely crashed the interpreter
    #[error("timeout waiting for second EOF reception")]
    TimeoutWaitingForSecondEof,

    /// A fixed-length handshake read timed out
    #[error("timed out reading from device")]
    ReadTimeout,

    /// The remote program wrote to its error stream. Carries both output
    /// streams; only surfaced as an error where the caller demands a
    /// clean execution.
    #[error("remote execution error: {}", String::from_utf8_lossy(stderr))]
    Remote {
        /// Normal output produced before the error
        stdout: Vec<u8>,
        /// The remote traceback
        stderr: Vec<u8>,
    },

    /// Filesystem lookup came back negative
    #[error("not found: {0}")]
    NotFound(String),

    /// The device printed something the literal parser cannot read
    #[error("could not parse device output: {0}")]
    Parse(#[from] LiteralError),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

impl ProtocolError {
    /// Create an `ExecFailed` error
    pub fn exec_failed(response: impl Into<Vec<u8>>) -> Self {
        Self::ExecFailed {
            response: response.into(),
        }
    }

    /// Whether this error is a "does not exist" remote traceback (or an
    /// already-degraded `NotFound`). The device reports missing paths as
    /// an `OSError` with `ENOENT`; there is no structured code, so this
    /// is a string match by policy.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Remote { stderr, .. } => {
                contains(stderr, b"OSError") && contains(stderr, b"ENOENT")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = ProtocolError::Remote {
            stdout: Vec::new(),
            stderr: b"Traceback (most recent call last):\r\n  File \"<stdin>\", line 2, in <module>\r\nOSError: [Errno 2] ENOENT\r\n".to_vec(),
        };
        assert!(err.is_not_found());

        let err = ProtocolError::Remote {
            stdout: Vec::new(),
            stderr: b"OSError: [Errno 13] EACCES\r\n".to_vec(),
        };
        assert!(!err.is_not_found());

        assert!(ProtocolError::NotFound("main.py".to_string()).is_not_found());
        assert!(!ProtocolError::EnterRawReplFailed.is_not_found());
    }

    #[test]
    fn test_exec_failed_display() {
        let err = ProtocolError::exec_failed(b"ra".to_vec());
        assert!(err.to_string().contains("could not exec command"));
    }
}
