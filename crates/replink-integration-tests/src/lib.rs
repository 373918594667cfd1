//! Integration tests and utilities for the replink workspace
//!
//! Provides [`MockBoard`], an in-memory device that speaks the raw-REPL
//! wire protocol, so session, arbiter and dispatcher behavior can be
//! exercised end to end without hardware.

use async_trait::async_trait;
use replink_transport::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ENTER_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const REBOOT_BANNER: &[u8] = b"MPY: soft reboot\r\n";
const EOF: u8 = 0x04;

/// Maps executed source text to (stdout, stderr).
pub type ExecHandler = Box<dyn FnMut(&[u8]) -> (Vec<u8>, Vec<u8>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Friendly prompt; everything but ctrl-A is ignored
    Friendly,
    /// Raw mode, waiting for a command or a control byte
    Raw,
    /// Collecting a ctrl-E raw-paste request (`A` then 0x01 pending)
    PasteRequest,
    /// Receiving flow-controlled source
    Paste,
    /// Aborted a paste; the next byte must be the host's 0x04 ack
    PasteAborted,
}

struct Inner {
    state: State,
    output: VecDeque<u8>,
    source: Vec<u8>,
    executed: Vec<Vec<u8>>,
    handler: ExecHandler,
    closed: bool,

    raw_paste: bool,
    window_size: u16,
    /// Bytes the host may still send before the next grant
    credit: usize,
    /// Total paste bytes after which the device aborts
    abort_after: Option<usize>,
    paste_received: usize,
    /// Never issue follow-up grants; a compliant host stalls after one
    /// window
    withhold_grants: bool,
    /// Grant a fresh window on every received byte, long before the
    /// outstanding credit is spent
    eager_grants: bool,
    abort_acked: bool,
    /// Host sent paste bytes while it held no credit
    overrun: bool,

    omit_first_eof: bool,
    omit_second_eof: bool,
}

impl Inner {
    fn push(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    fn feed(&mut self, byte: u8) {
        match self.state {
            State::Friendly => {
                if byte == 0x01 {
                    self.push(ENTER_BANNER);
                    self.state = State::Raw;
                }
            }
            State::Raw => match byte {
                0x01 => self.push(ENTER_BANNER),
                0x02 => self.state = State::Friendly,
                0x03 | b'\r' => {}
                0x05 => self.state = State::PasteRequest,
                EOF => {
                    if self.source.is_empty() {
                        // Soft reset request.
                        self.push(REBOOT_BANNER);
                        self.push(ENTER_BANNER);
                    } else {
                        // End of a fallback-mode command.
                        self.push(b"OK");
                        self.run_source();
                    }
                }
                other => self.source.push(other),
            },
            State::PasteRequest => {
                // Tail of the 0x05 'A' 0x01 request; respond on the
                // final byte.
                if byte == 0x01 {
                    if self.raw_paste {
                        self.push(b"R\x01");
                        let window = self.window_size.to_le_bytes();
                        self.push(&window);
                        self.credit = self.window_size as usize;
                        self.paste_received = 0;
                        self.state = State::Paste;
                    } else {
                        self.push(b"R\x00");
                        self.state = State::Raw;
                    }
                } else if byte != b'A' {
                    self.state = State::Raw;
                }
            }
            State::Paste => {
                if byte == EOF {
                    self.push(&[EOF]);
                    self.run_source();
                    self.state = State::Raw;
                    return;
                }
                if self.credit == 0 {
                    self.overrun = true;
                }
                self.credit = self.credit.saturating_sub(1);
                self.source.push(byte);
                self.paste_received += 1;
                if self.abort_after == Some(self.paste_received) {
                    self.push(&[EOF]);
                    self.source.clear();
                    self.state = State::PasteAborted;
                    return;
                }
                if self.eager_grants {
                    self.push(&[0x01]);
                    self.credit += self.window_size as usize;
                } else if self.credit == 0 && !self.withhold_grants {
                    self.push(&[0x01]);
                    self.credit = self.window_size as usize;
                }
            }
            State::PasteAborted => {
                // Bytes already in flight when the abort went out are
                // discarded; the first 0x04 is the host's ack.
                if byte == EOF {
                    self.abort_acked = true;
                    self.state = State::Raw;
                }
            }
        }
    }

    fn run_source(&mut self) {
        let source = std::mem::take(&mut self.source);
        let (stdout, stderr) = (self.handler)(&source);
        self.executed.push(source);
        self.push(&stdout);
        if self.omit_first_eof {
            return;
        }
        self.push(&[EOF]);
        self.push(&stderr);
        if self.omit_second_eof {
            return;
        }
        self.push(&[EOF]);
        self.push(b">");
    }
}

/// An in-memory device speaking the raw-REPL protocol.
pub struct MockBoard {
    inner: Arc<Mutex<Inner>>,
}

/// Inspection handle onto a [`MockBoard`], usable after the board has
/// been boxed away as a transport.
#[derive(Clone)]
pub struct MockBoardHandle {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBoard {
    /// A raw-paste-capable board with a 32-byte window and a handler
    /// that produces no output.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Friendly,
                output: VecDeque::new(),
                source: Vec::new(),
                executed: Vec::new(),
                handler: Box::new(|_| (Vec::new(), Vec::new())),
                closed: false,
                raw_paste: true,
                window_size: 32,
                credit: 0,
                abort_after: None,
                paste_received: 0,
                withhold_grants: false,
                eager_grants: false,
                abort_acked: false,
                overrun: false,
                omit_first_eof: false,
                omit_second_eof: false,
            })),
        }
    }

    /// Set the raw-paste window size.
    pub fn with_window(self, window_size: u16) -> Self {
        self.inner.lock().unwrap().window_size = window_size;
        self
    }

    /// Answer the raw-paste request with "understood but unsupported".
    pub fn without_raw_paste(self) -> Self {
        self.inner.lock().unwrap().raw_paste = false;
        self
    }

    /// Abort the paste after receiving this many source bytes.
    pub fn abort_after(self, bytes: usize) -> Self {
        self.inner.lock().unwrap().abort_after = Some(bytes);
        self
    }

    /// Never issue follow-up window grants during a paste.
    pub fn withhold_grants(self) -> Self {
        self.inner.lock().unwrap().withhold_grants = true;
        self
    }

    /// Grant a fresh window after every paste byte, so acks arrive
    /// while the host still holds credit from earlier grants.
    pub fn eager_grants(self) -> Self {
        self.inner.lock().unwrap().eager_grants = true;
        self
    }

    /// Never terminate the normal-output stream.
    pub fn omit_first_eof(self) -> Self {
        self.inner.lock().unwrap().omit_first_eof = true;
        self
    }

    /// Never terminate the error-output stream.
    pub fn omit_second_eof(self) -> Self {
        self.inner.lock().unwrap().omit_second_eof = true;
        self
    }

    /// Set what executions produce.
    pub fn with_handler(
        self,
        handler: impl FnMut(&[u8]) -> (Vec<u8>, Vec<u8>) + Send + 'static,
    ) -> Self {
        self.inner.lock().unwrap().handler = Box::new(handler);
        self
    }

    /// Get an inspection handle.
    pub fn handle(&self) -> MockBoardHandle {
        MockBoardHandle {
            inner: self.inner.clone(),
        }
    }
}

impl MockBoardHandle {
    /// Source texts the board has executed, in order
    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().executed.clone()
    }

    /// Whether the host ever sent beyond its granted credit
    pub fn overrun(&self) -> bool {
        self.inner.lock().unwrap().overrun
    }

    /// Paste bytes received so far in the current or last transfer
    pub fn paste_received(&self) -> usize {
        self.inner.lock().unwrap().paste_received
    }

    /// Whether the host acknowledged an abort with a 0x04
    pub fn abort_acked(&self) -> bool {
        self.inner.lock().unwrap().abort_acked
    }

    /// Whether the board is sitting at the friendly prompt
    pub fn at_friendly_prompt(&self) -> bool {
        self.inner.lock().unwrap().state == State::Friendly
    }

    /// Push unsolicited device output, as a program print would.
    pub fn inject(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().push(bytes);
    }
}

#[async_trait]
impl Transport for MockBoard {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.output.len() >= n {
                    return Ok(inner.output.drain(..n).collect());
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        for &byte in data {
            inner.feed(byte);
        }
        Ok(data.len())
    }

    fn bytes_waiting(&self) -> usize {
        self.inner.lock().unwrap().output.len()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_exit() {
        let board = MockBoard::new();
        let handle = board.handle();
        {
            let mut inner = board.inner.lock().unwrap();
            for &b in b"\r\x03\x03\r\x01" {
                inner.feed(b);
            }
            assert_eq!(inner.state, State::Raw);
            inner.feed(0x02);
        }
        assert!(handle.at_friendly_prompt());
    }

    #[test]
    fn test_fallback_exec_produces_ok_and_streams() {
        let board = MockBoard::new().without_raw_paste();
        let mut inner = board.inner.lock().unwrap();
        inner.state = State::Raw;
        for &b in b"\x05A\x01" {
            inner.feed(b);
        }
        assert_eq!(inner.output.drain(..).collect::<Vec<u8>>(), b"R\x00");
        for &b in b"print(1)\x04" {
            inner.feed(b);
        }
        let out: Vec<u8> = inner.output.drain(..).collect();
        assert!(out.starts_with(b"OK"));
        assert_eq!(inner.executed, vec![b"print(1)".to_vec()]);
    }
}
