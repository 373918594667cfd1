//! PTY-backed subprocess transport
//!
//! Some targets (notably emulators) behave differently on a pipe than
//! on a terminal. This transport runs the command on a local
//! pseudo-terminal via `portable-pty` and speaks to the master side.

use crate::buffer::ChannelBuffer;
use crate::error::{Result, TransportError};
use crate::traits::Transport;
use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// PTY subprocess transport
pub struct PtyTransport {
    // Kept alive for the lifetime of the transport; dropping the master
    // tears the slave side out from under the child.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    buffer: Arc<ChannelBuffer>,
    pump: Option<std::thread::JoinHandle<()>>,
}

impl PtyTransport {
    /// Spawn `command` (whitespace-split argv) attached to a fresh PTY.
    pub fn spawn(command: &str) -> Result<Self> {
        let mut argv = command.split_whitespace();
        let program = argv
            .next()
            .ok_or_else(|| TransportError::process("empty command"))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TransportError::process(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(argv);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TransportError::process(format!("failed to spawn '{command}': {e}")))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TransportError::process(format!("pty reader unavailable: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TransportError::process(format!("pty writer unavailable: {e}")))?;

        let buffer = Arc::new(ChannelBuffer::new());
        let pump_buffer = buffer.clone();
        let pump = std::thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => pump_buffer.push(&chunk[..n]),
                }
            }
            pump_buffer.close();
        });

        Ok(Self {
            _master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            buffer,
            pump: Some(pump),
        })
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.buffer.take(n).await)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.buffer.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    fn bytes_waiting(&self) -> usize {
        self.buffer.len()
    }

    async fn close(&mut self) -> Result<()> {
        {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = child.kill() {
                debug!("pty child kill failed: {e}");
            }
        }
        if let Some(pump) = self.pump.take() {
            let _ = tokio::task::spawn_blocking(move || pump.join()).await;
        }
        self.buffer.close();
        Ok(())
    }
}
