//! Arbiter behavior: background draining, lock strengths, subscriber
//! delivery, and connection replacement.

use async_trait::async_trait;
use replink::{Arbiter, ConnectOptions, LockStrength, PortEvent};
use replink_integration_tests::MockBoard;
use replink_transport::{Transport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A transport that only records whether it has been closed.
struct FlaggedPort {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for FlaggedPort {
    async fn read(&mut self, _n: usize) -> Result<Vec<u8>, TransportError> {
        std::future::pending().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        Ok(data.len())
    }

    fn bytes_waiting(&self) -> usize {
        0
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn collect_events(arbiter: &Arbiter) -> Arc<Mutex<Vec<PortEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    arbiter.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn data_bytes(events: &Mutex<Vec<PortEvent>>) -> Vec<u8> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            PortEvent::Data(d) => Some(d.clone()),
            PortEvent::Status(_) => None,
        })
        .flatten()
        .collect()
}

#[tokio::test]
async fn test_drain_forwards_unsolicited_output() {
    let arbiter = Arbiter::new();
    let events = collect_events(&arbiter);

    let board = MockBoard::new();
    let handle = board.handle();
    arbiter.adopt(Box::new(board), "mock").await;

    handle.inject(b"hello from the device");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(data_bytes(&events), b"hello from the device");
}

#[tokio::test]
async fn test_full_lock_pauses_draining() {
    let arbiter = Arbiter::new();
    let events = collect_events(&arbiter);

    let board = MockBoard::new();
    let handle = board.handle();
    arbiter.adopt(Box::new(board), "mock").await;

    let guard = arbiter.lock(LockStrength::Full).await;
    handle.inject(b"held back");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(data_bytes(&events).is_empty(), "drain ran under full lock");

    drop(guard);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(data_bytes(&events), b"held back");
}

#[tokio::test]
async fn test_send_lock_keeps_draining() {
    let arbiter = Arbiter::new();
    let events = collect_events(&arbiter);

    let board = MockBoard::new();
    let handle = board.handle();
    arbiter.adopt(Box::new(board), "mock").await;

    let _guard = arbiter.lock(LockStrength::Send).await;
    handle.inject(b"still flowing");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(data_bytes(&events), b"still flowing");
}

#[tokio::test]
async fn test_send_reaches_the_device() {
    let arbiter = Arbiter::new();
    let events = collect_events(&arbiter);

    let board = MockBoard::new();
    arbiter.adopt(Box::new(board), "mock").await;

    // Ctrl-A makes the mock print its raw REPL banner; the drain task
    // forwards it like any other device output.
    arbiter.send(b"\r\x01").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let data = data_bytes(&events);
    assert!(
        data.ends_with(b"raw REPL; CTRL-B to exit\r\n>"),
        "{:?}",
        String::from_utf8_lossy(&data)
    );
}

#[tokio::test]
async fn test_adopt_replaces_previous_connection() {
    let arbiter = Arbiter::new();
    let events = collect_events(&arbiter);

    let first = MockBoard::new();
    let first_handle = first.handle();
    arbiter.adopt(Box::new(first), "first").await;

    let second = MockBoard::new();
    let second_handle = second.handle();
    arbiter.adopt(Box::new(second), "second").await;

    first_handle.inject(b"ghost");
    second_handle.inject(b"live");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(data_bytes(&events), b"live");
    let statuses: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            PortEvent::Status(s) => Some(s.clone()),
            PortEvent::Data(_) => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            "Serial port changed to first".to_string(),
            "Serial port changed to second".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_adopt_closes_previous_transport() {
    let arbiter = Arbiter::new();
    let closed = Arc::new(AtomicBool::new(false));
    let first = FlaggedPort {
        closed: closed.clone(),
    };
    arbiter.adopt(Box::new(first), "first").await;

    arbiter.adopt(Box::new(MockBoard::new()), "second").await;
    assert!(
        closed.load(Ordering::Relaxed),
        "previous transport left open"
    );
}

#[tokio::test]
async fn test_failed_open_closes_previous_connection() {
    let arbiter = Arbiter::new();
    let closed = Arc::new(AtomicBool::new(false));
    let first = FlaggedPort {
        closed: closed.clone(),
    };
    arbiter.adopt(Box::new(first), "first").await;

    let result = arbiter
        .open("/dev/does-not-exist", ConnectOptions::default())
        .await;
    assert!(result.is_err());
    assert!(closed.load(Ordering::Relaxed));
    assert!(!arbiter.is_open().await);
}

#[tokio::test]
async fn test_close_stops_everything() {
    let arbiter = Arbiter::new();
    let events = collect_events(&arbiter);

    let board = MockBoard::new();
    let handle = board.handle();
    arbiter.adopt(Box::new(board), "mock").await;
    assert!(arbiter.is_open().await);

    arbiter.close().await.unwrap();
    assert!(!arbiter.is_open().await);

    handle.inject(b"after close");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(data_bytes(&events).is_empty());

    let statuses: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            PortEvent::Status(s) => Some(s.clone()),
            PortEvent::Data(_) => None,
        })
        .collect();
    assert_eq!(statuses.last().map(String::as_str), Some("Serial port closed"));
}
