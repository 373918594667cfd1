//! Shared-port arbiter
//!
//! One process, one port, many interested parties. The arbiter owns the
//! transport, runs a background drain task that forwards unsolicited
//! device output to subscribers, and hands out a cooperative lock in
//! two strengths:
//!
//! - **Send**: serializes writers against each other. The drain task
//!   keeps running, so device responses still reach subscribers.
//! - **Full**: additionally pauses the drain task so the holder can
//!   read the port itself. Protocol sessions need this strength; a
//!   concurrent drain would steal terminator bytes.
//!
//! Acquisition is first-come-first-served across both strengths, and a
//! guard dropped mid-operation always returns the state to free.

use crate::error::{ClientError, Result};
use replink_transport::{ConnectOptions, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drain task poll interval while the port is free.
const DRAIN_TICK: Duration = Duration::from_millis(10);
/// Drain task poll interval while a full lock is held.
const LOCKED_TICK: Duration = Duration::from_millis(100);
/// Settle time after taking a full lock, letting an in-flight drain
/// iteration finish before the holder starts reading.
const FULL_LOCK_GRACE: Duration = Duration::from_millis(50);

/// How strongly a holder claims the port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrength {
    /// Exclusive writer; background draining continues
    Send,
    /// Exclusive reader and writer; background draining pauses
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Free,
    SendLocked,
    FullLocked,
}

/// An event published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// Bytes the device sent outside any locked operation
    Data(Vec<u8>),
    /// A lifecycle or fault notice, human readable
    Status(String),
}

/// Handle returned by [`Arbiter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn Fn(&PortEvent) + Send + Sync>;

/// The port claim itself. Dropping it frees the port; the drain task
/// resumes on its next tick.
pub struct PortGuard {
    _queue: OwnedMutexGuard<()>,
    shared: Arc<Shared>,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        *lock_ignore_poison(&self.shared.lock_state) = LockState::Free;
    }
}

struct Shared {
    transport: Arc<tokio::sync::Mutex<Option<Box<dyn Transport>>>>,
    lock_state: Mutex<LockState>,
    // Tokio mutexes grant in FIFO order; this one is the lock queue.
    lock_queue: Arc<tokio::sync::Mutex<()>>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

/// Process-wide owner of one device connection.
pub struct Arbiter {
    shared: Arc<Shared>,
    drain: Mutex<Option<(Arc<AtomicBool>, JoinHandle<()>)>>,
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Arbiter {
    /// Create an arbiter with no port open.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                transport: Arc::new(tokio::sync::Mutex::new(None)),
                lock_state: Mutex::new(LockState::Free),
                lock_queue: Arc::new(tokio::sync::Mutex::new(())),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
            drain: Mutex::new(None),
        }
    }

    /// Open (or switch to) a device. Any previous connection is fully
    /// closed and its drain task joined before the new one is made, so
    /// two connections never overlap on the port.
    pub async fn open(&self, device: &str, options: ConnectOptions) -> Result<()> {
        self.teardown().await?;
        let transport = replink_transport::connect(device, options).await?;
        self.install(transport, device).await;
        Ok(())
    }

    /// Install an already-open transport under this arbiter. Used by
    /// [`Arbiter::open`] and directly by callers with a custom
    /// transport. Any previous transport is closed first; a failure to
    /// close it is logged, not propagated.
    pub async fn adopt(&self, transport: Box<dyn Transport>, label: &str) {
        if let Err(e) = self.teardown().await {
            debug!("closing previous transport failed: {e}");
        }
        self.install(transport, label).await;
    }

    async fn install(&self, transport: Box<dyn Transport>, label: &str) {
        *self.shared.transport.lock().await = Some(transport);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(drain_loop(self.shared.clone(), stop.clone()));
        *lock_ignore_poison(&self.drain) = Some((stop, handle));

        info!("serial port changed to {label}");
        self.notify(&PortEvent::Status(format!("Serial port changed to {label}")));
    }

    /// Close the current connection, if any.
    pub async fn close(&self) -> Result<()> {
        if self.teardown().await? {
            self.notify(&PortEvent::Status("Serial port closed".to_string()));
        }
        Ok(())
    }

    /// Stop the drain task and close whatever transport is installed.
    /// Returns whether there was one. No subscriber notification; the
    /// callers decide what the event is.
    async fn teardown(&self) -> Result<bool> {
        self.stop_drain().await;
        match self.shared.transport.lock().await.take() {
            Some(mut transport) => {
                transport.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether a port is currently open
    pub async fn is_open(&self) -> bool {
        self.shared.transport.lock().await.is_some()
    }

    /// Claim the port. Waits behind earlier claimants of either
    /// strength; a full claim additionally waits out the settle time so
    /// the drain task has let go of the transport.
    pub async fn lock(&self, strength: LockStrength) -> PortGuard {
        let queue = self.shared.lock_queue.clone().lock_owned().await;
        *lock_ignore_poison(&self.shared.lock_state) = match strength {
            LockStrength::Send => LockState::SendLocked,
            LockStrength::Full => LockState::FullLocked,
        };
        if strength == LockStrength::Full {
            tokio::time::sleep(FULL_LOCK_GRACE).await;
        }
        PortGuard {
            _queue: queue,
            shared: self.shared.clone(),
        }
    }

    /// Direct access to the transport slot. Hold a full-strength
    /// [`PortGuard`] first when reading, or the drain task races you
    /// for the bytes.
    pub async fn claim(&self) -> OwnedMutexGuard<Option<Box<dyn Transport>>> {
        self.shared.transport.clone().lock_owned().await
    }

    /// Write to the port under a send-strength claim. A write failure
    /// is reported to subscribers rather than returned; the caller
    /// usually cannot do anything about a disconnected port anyway.
    pub async fn send(&self, data: &[u8]) {
        let _guard = self.lock(LockStrength::Send).await;
        let mut slot = self.shared.transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            self.notify(&PortEvent::Status("No port is open".to_string()));
            return;
        };
        if let Err(e) = transport.write(data).await {
            debug!("send failed: {e}");
            self.notify(&PortEvent::Status(
                "Error writing to serial port. It may be disconnected".to_string(),
            ));
        }
    }

    /// Register a callback for port events. Callbacks run on the drain
    /// task in subscription order and must not block.
    pub fn subscribe(
        &self,
        callback: impl Fn(&PortEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        lock_ignore_poison(&self.shared.subscribers).push((id, Box::new(callback)));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock_ignore_poison(&self.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    fn notify(&self, event: &PortEvent) {
        self.shared.notify(event);
    }

    async fn stop_drain(&self) {
        let previous = lock_ignore_poison(&self.drain).take();
        if let Some((stop, handle)) = previous {
            stop.store(true, Ordering::Relaxed);
            if handle.await.is_err() {
                warn!("drain task panicked");
            }
        }
    }
}

impl Shared {
    fn notify(&self, event: &PortEvent) {
        for (_, subscriber) in lock_ignore_poison(&self.subscribers).iter() {
            subscriber(event);
        }
    }
}

/// Forward unsolicited device bytes to subscribers until stopped.
///
/// `try_lock` on the transport slot keeps this task from ever blocking
/// a lock holder; the lock-state check just picks the poll pace.
async fn drain_loop(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let state = *lock_ignore_poison(&shared.lock_state);
        if state == LockState::FullLocked {
            tokio::time::sleep(LOCKED_TICK).await;
            continue;
        }

        let mut pulled = Vec::new();
        if let Ok(mut slot) = shared.transport.try_lock() {
            if let Some(transport) = slot.as_mut() {
                let waiting = transport.bytes_waiting();
                if waiting > 0 {
                    match transport.read(waiting).await {
                        Ok(data) => pulled = data,
                        Err(e) => {
                            debug!("drain read failed: {e}");
                        }
                    }
                }
            }
        }

        // Stream-terminator bytes are protocol framing, not output;
        // they never reach a subscriber.
        let pulled = replink_protocol::strip_eof(&pulled);
        if pulled.is_empty() {
            tokio::time::sleep(DRAIN_TICK).await;
        } else {
            shared.notify(&PortEvent::Data(pulled));
        }
    }
    debug!("drain task stopped");
}

/// A poisoned mutex here only means a subscriber callback panicked; the
/// protected data is still sound, so keep going.
fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Convenience for callers that want a hard error instead of a silent
/// no-op when nothing is open.
pub(crate) fn require_open<'a>(
    slot: &'a mut Option<Box<dyn Transport>>,
) -> Result<&'a mut (dyn Transport + 'a)> {
    match slot.as_mut() {
        Some(transport) => Ok(transport.as_mut()),
        None => Err(ClientError::NotConnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_guard_drop_frees_state() {
        let arbiter = Arbiter::new();
        {
            let _guard = arbiter.lock(LockStrength::Full).await;
            assert_eq!(
                *lock_ignore_poison(&arbiter.shared.lock_state),
                LockState::FullLocked
            );
        }
        assert_eq!(
            *lock_ignore_poison(&arbiter.shared.lock_state),
            LockState::Free
        );
        // Free again means a second claim goes straight through.
        let _guard = arbiter.lock(LockStrength::Send).await;
        assert_eq!(
            *lock_ignore_poison(&arbiter.shared.lock_state),
            LockState::SendLocked
        );
    }

    #[tokio::test]
    async fn test_subscribers_called_in_order() {
        let arbiter = Arbiter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            arbiter.subscribe(move |_| log.lock().unwrap().push(tag));
        }
        arbiter.notify(&PortEvent::Status("hello".to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let arbiter = Arbiter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let id = arbiter.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        arbiter.notify(&PortEvent::Status("one".to_string()));
        assert!(arbiter.unsubscribe(id));
        assert!(!arbiter.unsubscribe(id));
        arbiter.notify(&PortEvent::Status("two".to_string()));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_send_without_port_reports_status() {
        let arbiter = Arbiter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        arbiter.subscribe(move |event| {
            if let PortEvent::Status(s) = event {
                sink.lock().unwrap().push(s.clone());
            }
        });
        arbiter.send(b"hello").await;
        assert_eq!(*log.lock().unwrap(), vec!["No port is open".to_string()]);
    }
}
