//! Physical serial port transport
//!
//! Wraps a `serial2::SerialPort`. The port allows shared reads and
//! writes, so a dedicated thread pumps incoming bytes into the
//! [`ChannelBuffer`] while writes go straight to the port.

use crate::buffer::ChannelBuffer;
use crate::error::{Result, TransportError};
use crate::traits::Transport;
use async_trait::async_trait;
use serial2::SerialPort;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// How long the pump thread blocks per read before re-checking the stop
/// flag.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port transport
pub struct SerialTransport {
    port: Arc<SerialPort>,
    buffer: Arc<ChannelBuffer>,
    stop: Arc<AtomicBool>,
    pump: Option<std::thread::JoinHandle<()>>,
}

impl SerialTransport {
    /// Open a serial device at the given baud rate.
    ///
    /// A busy or not-yet-enumerated device is retried once per second up
    /// to `wait` extra attempts before the open is reported as failed.
    pub async fn open(device: &str, baud_rate: u32, wait: u32) -> Result<Self> {
        let mut last_err = None;
        let mut port = None;
        for attempt in 0..=wait {
            match SerialPort::open(device, baud_rate) {
                Ok(p) => {
                    port = Some(p);
                    break;
                }
                Err(e) => {
                    debug!(device, attempt, "serial open failed: {e}");
                    last_err = Some(e);
                    if attempt < wait {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        let mut port = match port {
            Some(p) => p,
            None => {
                let reason = last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(TransportError::open_failed(device, reason));
            }
        };
        port.set_read_timeout(PUMP_READ_TIMEOUT)?;

        let port = Arc::new(port);
        let buffer = Arc::new(ChannelBuffer::new());
        let stop = Arc::new(AtomicBool::new(false));
        let pump = spawn_pump(port.clone(), buffer.clone(), stop.clone());

        Ok(Self {
            port,
            buffer,
            stop,
            pump: Some(pump),
        })
    }
}

fn spawn_pump(
    port: Arc<SerialPort>,
    buffer: Arc<ChannelBuffer>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        while !stop.load(Ordering::Relaxed) {
            match port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.push(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => {
                    debug!("serial pump stopping: {e}");
                    break;
                }
            }
        }
        buffer.close();
    })
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.buffer.take(n).await)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.buffer.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut written = 0;
        while written < data.len() {
            written += self.port.write(&data[written..])?;
        }
        Ok(written)
    }

    fn bytes_waiting(&self) -> usize {
        self.buffer.len()
    }

    async fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            let _ = tokio::task::spawn_blocking(move || pump.join()).await;
        }
        self.buffer.close();
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
