//! Shared receive buffer for transport implementations
//!
//! Every concrete transport pumps incoming bytes from its underlying
//! channel (thread or task) into a [`ChannelBuffer`]; the `Transport`
//! methods `read` and `bytes_waiting` are then uniform across all of
//! them. The buffer is poll-based at a fixed tick, which is also how
//! the protocol layer above bounds its waits.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Granularity at which pending reads re-check the buffer.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Inner {
    data: VecDeque<u8>,
    closed: bool,
}

/// Byte queue between a transport's receive pump and its reader.
///
/// `push` is called from the pump side (a blocking thread for serial and
/// PTY channels, a tokio task for sockets and pipes); `take` and
/// `take_waiting` are called from the transport's `read` path. When the
/// pump observes the channel go away it calls `close`; readers blocked
/// in `take` keep waiting so the caller's own timeout reports the
/// failure, matching the "no further data" contract.
#[derive(Default)]
pub struct ChannelBuffer {
    inner: Mutex<Inner>,
}

impl ChannelBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue state stays sound across a panicking pusher, so poisoning
    /// is ignored rather than propagated to every reader.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append received bytes (pump side)
    pub fn push(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        if !inner.closed {
            inner.data.extend(bytes);
        }
    }

    /// Mark the channel as gone; no further bytes will be accepted
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
    }

    /// Whether the pump has marked the channel as gone
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of bytes currently waiting
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Whether no bytes are currently waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take exactly `n` bytes, waiting until they are available
    pub async fn take(&self, n: usize) -> Vec<u8> {
        loop {
            {
                let mut inner = self.lock();
                if inner.data.len() >= n {
                    return inner.data.drain(..n).collect();
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drain and return every byte currently waiting, without blocking
    pub fn take_waiting(&self) -> Vec<u8> {
        let mut inner = self.lock();
        inner.data.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_exact() {
        let buf = ChannelBuffer::new();
        buf.push(b"hello world");
        assert_eq!(buf.take(5).await, b"hello");
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.take_waiting(), b" world");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_take_waits_for_data() {
        let buf = std::sync::Arc::new(ChannelBuffer::new());
        let pushed = buf.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pushed.push(b"ab");
        });
        assert_eq!(buf.take(2).await, b"ab");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let buf = ChannelBuffer::new();
        buf.push(b"x");
        buf.close();
        buf.push(b"y");
        assert_eq!(buf.len(), 1);
        assert!(buf.is_closed());
    }
}
