//! Telnet transport
//!
//! A TCP connection to a board exposing its REPL over telnet (e.g. the
//! WebREPL-era telnet daemon). Handles the login prompt dance and
//! refuses all telnet option negotiation so the byte stream stays clean.

use crate::buffer::{ChannelBuffer, POLL_INTERVAL};
use crate::error::{Result, TransportError};
use crate::traits::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

const TELNET_PORT: u16 = 23;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Telnet-negotiated socket transport
pub struct TelnetTransport {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    buffer: Arc<ChannelBuffer>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl TelnetTransport {
    /// Connect to `host` and log in with the given credentials.
    ///
    /// The connection is only considered established once the login
    /// banner has been seen; anything short of that is an error.
    pub async fn connect(
        host: &str,
        user: &str,
        password: &str,
        read_timeout: Duration,
    ) -> Result<Self> {
        Self::connect_port(host, TELNET_PORT, user, password, read_timeout).await
    }

    /// Like [`TelnetTransport::connect`], for a daemon listening on a
    /// non-standard port.
    pub async fn connect_port(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        read_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::open_failed(host, "connect timed out"))?
            .map_err(|e| TransportError::open_failed(host, e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let buffer = Arc::new(ChannelBuffer::new());
        let pump = tokio::spawn(pump_loop(read_half, writer.clone(), buffer.clone()));

        let mut transport = Self {
            writer,
            buffer,
            pump: Some(pump),
        };
        if let Err(e) = transport.login(user, password, read_timeout).await {
            // A failed login must not leave a half-open socket behind;
            // the pump task owns the read half and would otherwise keep
            // the connection alive.
            let _ = transport.close().await;
            return Err(e);
        }
        Ok(transport)
    }

    async fn login(&mut self, user: &str, password: &str, read_timeout: Duration) -> Result<()> {
        let failed =
            || TransportError::connection("failed to establish a telnet connection with the board");

        read_until_match(&self.buffer, b"Login as:", read_timeout)
            .await
            .ok_or_else(failed)?;
        self.write(format!("{user}\r\n").as_bytes()).await?;

        read_until_match(&self.buffer, b"Password:", read_timeout)
            .await
            .ok_or_else(failed)?;
        // The telnet server needs a moment between the prompt and the
        // password actually being accepted.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.write(format!("{password}\r\n").as_bytes()).await?;

        read_until_match(&self.buffer, b"for more information.", read_timeout)
            .await
            .ok_or_else(failed)?;
        debug!("telnet login complete");
        Ok(())
    }
}

/// Accumulate incoming bytes until `pattern` appears, or give up after
/// `timeout`. Returns the accumulated bytes on a match.
async fn read_until_match(
    buffer: &ChannelBuffer,
    pattern: &[u8],
    timeout: Duration,
) -> Option<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut acc = Vec::new();
    loop {
        acc.extend(buffer.take_waiting());
        if acc.windows(pattern.len()).any(|w| w == pattern) {
            return Some(acc);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Strip telnet protocol bytes from the stream and refuse every option
/// the server proposes, leaving pure REPL bytes in the buffer.
async fn pump_loop(
    mut read_half: OwnedReadHalf,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    buffer: Arc<ChannelBuffer>,
) {
    #[derive(Clone, Copy)]
    enum State {
        Data,
        Iac,
        Negotiate(u8),
        Subnegotiation,
        SubnegotiationIac,
    }

    let mut state = State::Data;
    let mut chunk = [0u8; 4096];
    let mut clean = Vec::with_capacity(4096);

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        clean.clear();
        let mut replies = Vec::new();
        for &byte in &chunk[..n] {
            state = match (state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    clean.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    // Escaped 0xFF data byte.
                    clean.push(IAC);
                    State::Data
                }
                (State::Iac, verb @ (WILL | WONT | DO | DONT)) => State::Negotiate(verb),
                (State::Iac, SB) => State::Subnegotiation,
                (State::Iac, _) => State::Data,
                (State::Negotiate(verb), option) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    State::Data
                }
                (State::Subnegotiation, IAC) => State::SubnegotiationIac,
                (State::Subnegotiation, _) => State::Subnegotiation,
                (State::SubnegotiationIac, SE) => State::Data,
                (State::SubnegotiationIac, _) => State::Subnegotiation,
            };
        }
        if !replies.is_empty() {
            let mut w = writer.lock().await;
            let _ = w.write_all(&replies).await;
        }
        buffer.push(&clean);
    }
    buffer.close();
}

#[async_trait]
impl Transport for TelnetTransport {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.buffer.take(n).await)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.buffer.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut w = self.writer.lock().await;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(data.len())
    }

    fn bytes_waiting(&self) -> usize {
        self.buffer.len()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
        self.buffer.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_failed_login_shuts_the_socket_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A server that never shows a login prompt, then waits for the
        // client side of the socket to go away.
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"not a telnet daemon\r\n").await.unwrap();
            let mut scratch = [0u8; 64];
            loop {
                match sock.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let result = TelnetTransport::connect_port(
            "127.0.0.1",
            port,
            "micro",
            "python",
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Connection(_))));

        // The failed connect must have torn the socket down; the server
        // sees EOF instead of hanging on a half-open connection.
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("socket left open after failed login")
            .unwrap();
    }
}
