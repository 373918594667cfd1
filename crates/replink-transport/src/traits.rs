//! Transport trait
//!
//! Defines the generic `Transport` trait implemented by the serial,
//! telnet, subprocess, and PTY channels.

use crate::error::Result;
use async_trait::async_trait;

/// Generic duplex byte channel
///
/// A transport carries bytes and nothing else; it has no knowledge of
/// the REPL protocol framed on top of it. Reads are exact: `read(n)`
/// resolves only once `n` bytes have arrived. Callers that need a bound
/// on the wait wrap the read in a timeout; a closed channel simply stops
/// producing bytes and lets that timeout expire.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read exactly `n` bytes, waiting until they have arrived
    async fn read(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Write all of `data`, returning the number of bytes written
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Number of received bytes waiting to be read
    fn bytes_waiting(&self) -> usize;

    /// Close the transport and release the underlying channel
    async fn close(&mut self) -> Result<()>;
}
