//! Piped subprocess transport
//!
//! Runs a command (e.g. a micropython unix port or a QEMU wrapper) and
//! emulates a serial connection over its stdin/stdout pipes.

use crate::buffer::ChannelBuffer;
use crate::error::{Result, TransportError};
use crate::traits::Transport;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;

/// Child-process pipe transport
pub struct SubprocessTransport {
    child: Child,
    stdin: ChildStdin,
    buffer: Arc<ChannelBuffer>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl SubprocessTransport {
    /// Spawn `command` through the shell and attach to its pipes.
    pub fn spawn(command: &str) -> Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::process(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::process("failed to get stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::process("failed to get stdout"))?;

        let buffer = Arc::new(ChannelBuffer::new());
        let pump_buffer = buffer.clone();
        let pump = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => pump_buffer.push(&chunk[..n]),
                }
            }
            pump_buffer.close();
        });

        Ok(Self {
            child,
            stdin,
            buffer,
            pump: Some(pump),
        })
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.buffer.take(n).await)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.buffer.is_closed() {
            return Err(TransportError::Closed);
        }
        self.stdin.write_all(data).await?;
        self.stdin.flush().await?;
        Ok(data.len())
    }

    fn bytes_waiting(&self) -> usize {
        self.buffer.len()
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.child.kill().await {
            debug!("subprocess kill failed: {e}");
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        self.buffer.close();
        Ok(())
    }
}
