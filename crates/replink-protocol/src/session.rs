//! Raw-REPL session state machine
//!
//! A [`Session`] borrows an exclusively-held transport and drives the
//! interpreter's machine-readable "raw" mode: interrupt and reset,
//! source execution with flow control, and retrieval of the two
//! 0x04-terminated output streams each execution produces.
//!
//! The session tracks two pieces of state. `in_raw_repl` must mirror
//! the device exactly or every subsequent read misinterprets terminator
//! bytes, so it changes only on explicit enter/exit. The raw-paste
//! negotiation outcome is cached: a device that answered "unsupported"
//! once is never asked again for the life of the session.

use crate::error::{ProtocolError, Result};
use crate::pyliteral::{self, Value};
use replink_transport::Transport;
use std::time::Duration;
use tracing::{debug, warn};

/// Interrupt any running program (ctrl-C, sent twice).
const INTERRUPT: &[u8] = b"\r\x03\x03";
/// Enter raw REPL (ctrl-A).
const ENTER_RAW: &[u8] = b"\r\x01";
/// Exit raw REPL back to the friendly prompt (ctrl-B).
const EXIT_RAW: &[u8] = b"\r\x02";
/// Soft reset / end-of-data marker / stream terminator.
const EOF: u8 = 0x04;
/// Request raw-paste mode.
const RAW_PASTE_REQUEST: &[u8] = b"\x05A\x01";

const RAW_REPL_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const RAW_REPL_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";
const SOFT_REBOOT_BANNER: &[u8] = b"soft reboot\r\n";

/// Poll granularity for bounded reads.
const READ_TICK: Duration = Duration::from_millis(10);
/// Fallback writer sends this much per pacing interval.
const FALLBACK_CHUNK: usize = 256;

/// Whether the device supports raw-paste mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPasteSupport {
    /// Not yet negotiated
    Unknown,
    /// Negotiated: supported, windowed transfer in use
    Supported,
    /// Negotiated: understood but unsupported, fallback writer in use
    Unsupported,
}

/// Both output streams of one execution.
///
/// A non-empty error stream is data, not a protocol fault: the remote
/// program failing and the link failing are different failure domains.
/// Callers that require a clean execution use [`ExecOutput::into_result`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Normal output, terminator stripped
    pub stdout: Vec<u8>,
    /// Error output (remote traceback), terminator stripped
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Whether the remote program produced no error output
    pub fn success(&self) -> bool {
        self.stderr.is_empty()
    }

    /// Demand a clean execution: non-empty stderr becomes
    /// [`ProtocolError::Remote`] carrying both streams.
    pub fn into_result(self) -> Result<Vec<u8>> {
        if self.stderr.is_empty() {
            Ok(self.stdout)
        } else {
            Err(ProtocolError::Remote {
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Incremental receiver for execution output, fed chunks as they
/// arrive. Stream-terminator bytes never reach the consumer.
pub type DataConsumer<'a> = &'a mut (dyn FnMut(&[u8]) + Send);

/// Remove stream-terminator bytes from a display-bound chunk.
pub fn strip_eof(data: &[u8]) -> Vec<u8> {
    data.iter().copied().filter(|&b| b != EOF).collect()
}

/// Raw-REPL protocol session over a borrowed transport.
///
/// The transport must be held exclusively for the whole lifetime of the
/// session; a concurrent reader would race it for terminator bytes and
/// corrupt framing. In this workspace the arbiter's full-strength lock
/// provides that exclusivity.
pub struct Session<'t> {
    transport: &'t mut dyn Transport,
    in_raw_repl: bool,
    raw_paste: RawPasteSupport,
    timeout: Duration,
}

impl<'t> Session<'t> {
    /// Create a session over an exclusively-held transport.
    pub fn new(transport: &'t mut dyn Transport) -> Self {
        Self {
            transport,
            in_raw_repl: false,
            raw_paste: RawPasteSupport::Unknown,
            timeout: Duration::from_secs(10),
        }
    }

    /// Override the per-read timeout (default 10 s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the device is currently in raw REPL mode
    pub fn in_raw_repl(&self) -> bool {
        self.in_raw_repl
    }

    /// The cached raw-paste negotiation outcome
    pub fn raw_paste_support(&self) -> RawPasteSupport {
        self.raw_paste
    }

    /// Read exactly `n` bytes, bounded by the session timeout.
    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.transport.read(n))
            .await
            .map_err(|_| ProtocolError::ReadTimeout)?
            .map_err(ProtocolError::from)
    }

    /// Discard everything currently waiting on the transport.
    async fn drain_input(&mut self) -> Result<()> {
        loop {
            let waiting = self.transport.bytes_waiting();
            if waiting == 0 {
                return Ok(());
            }
            self.transport.read(waiting).await?;
        }
    }

    /// Accumulate bytes until `ending` is seen or the inter-byte budget
    /// runs out. Callers check the trailer and map a short read to their
    /// own error; truncated data is never an implicit success.
    async fn read_until(
        &mut self,
        ending: &[u8],
        timeout: Duration,
        mut consumer: Option<DataConsumer<'_>>,
    ) -> Result<Vec<u8>> {
        let budget = (timeout.as_millis() / READ_TICK.as_millis()).max(1) as u32;
        let mut idle_ticks = 0u32;
        let mut data = Vec::new();
        loop {
            if data.ends_with(ending) {
                return Ok(data);
            }
            if self.transport.bytes_waiting() > 0 {
                let byte = self.transport.read(1).await?;
                if let Some(consumer) = consumer.as_mut()
                    && byte[0] != EOF
                {
                    consumer(&byte);
                }
                data.extend_from_slice(&byte);
                idle_ticks = 0;
            } else {
                idle_ticks += 1;
                if idle_ticks >= budget {
                    return Ok(data);
                }
                tokio::time::sleep(READ_TICK).await;
            }
        }
    }

    /// Interrupt the interpreter and switch it into raw REPL mode.
    ///
    /// With `soft_reset` the device is also rebooted so the execution
    /// environment starts clean (boot output shows up between the two
    /// banners). `in_raw_repl` becomes true only on full success.
    pub async fn enter_raw_repl(&mut self, soft_reset: bool) -> Result<()> {
        self.transport.write(INTERRUPT).await?;
        self.drain_input().await?;
        self.transport.write(ENTER_RAW).await?;

        if soft_reset {
            let data = self.read_until(RAW_REPL_PROMPT, self.timeout, None).await?;
            if !data.ends_with(RAW_REPL_PROMPT) {
                warn!("raw REPL prompt not seen: {:?}", String::from_utf8_lossy(&data));
                return Err(ProtocolError::EnterRawReplFailed);
            }
            self.transport.write(&[EOF]).await?;
            // "soft reboot" is waited for separately from the banner so
            // boot.py output can land in between.
            let data = self
                .read_until(SOFT_REBOOT_BANNER, self.timeout, None)
                .await?;
            if !data.ends_with(SOFT_REBOOT_BANNER) {
                warn!("soft reboot not seen: {:?}", String::from_utf8_lossy(&data));
                return Err(ProtocolError::EnterRawReplFailed);
            }
        }

        let data = self.read_until(RAW_REPL_BANNER, self.timeout, None).await?;
        if !data.ends_with(RAW_REPL_BANNER) {
            warn!("raw REPL banner not seen: {:?}", String::from_utf8_lossy(&data));
            return Err(ProtocolError::EnterRawReplFailed);
        }

        debug!("entered raw REPL");
        self.in_raw_repl = true;
        Ok(())
    }

    /// Switch the device back to the friendly prompt.
    ///
    /// Best effort: the device may already be gone, so the local state
    /// flips regardless of whether the write lands.
    pub async fn exit_raw_repl(&mut self) {
        if let Err(e) = self.transport.write(EXIT_RAW).await {
            debug!("exit_raw_repl write failed: {e}");
        }
        self.in_raw_repl = false;
    }

    /// Collect the two 0x04-terminated output streams of an execution.
    pub async fn follow(
        &mut self,
        timeout: Duration,
        consumer: Option<DataConsumer<'_>>,
    ) -> Result<ExecOutput> {
        let mut stdout = self.read_until(&[EOF], timeout, consumer).await?;
        if stdout.pop() != Some(EOF) {
            return Err(ProtocolError::TimeoutWaitingForFirstEof);
        }
        let mut stderr = self.read_until(&[EOF], timeout, None).await?;
        if stderr.pop() != Some(EOF) {
            return Err(ProtocolError::TimeoutWaitingForSecondEof);
        }
        Ok(ExecOutput { stdout, stderr })
    }

    /// Windowed raw-paste transfer (flow controlled by the device).
    ///
    /// The device announces a window size `W`; the host may have at most
    /// the granted credit outstanding. Each 0x01 grants one more window.
    /// Credit is accumulated unconditionally: a grant arriving while
    /// credit remains is banked, never dropped.
    async fn raw_paste_write(&mut self, source: &[u8]) -> Result<()> {
        let header = self.read_exact(2).await?;
        let window_size = u16::from_le_bytes([header[0], header[1]]) as usize;
        let mut remaining = window_size;
        debug!(window_size, "raw paste window");

        let mut i = 0;
        while i < source.len() {
            while remaining == 0 || self.transport.bytes_waiting() > 0 {
                let byte = self.read_exact(1).await?[0];
                match byte {
                    0x01 => remaining += window_size,
                    EOF => {
                        // Abrupt device-side end: acknowledge and report
                        // the partial transfer.
                        self.transport.write(&[EOF]).await?;
                        return Err(ProtocolError::AbortedByDevice);
                    }
                    other => return Err(ProtocolError::UnexpectedByteDuringPaste(other)),
                }
            }
            let chunk = &source[i..(i + remaining).min(source.len())];
            self.transport.write(chunk).await?;
            remaining -= chunk.len();
            i += chunk.len();
        }

        self.transport.write(&[EOF]).await?;
        let data = self.read_until(&[EOF], self.timeout, None).await?;
        if !data.ends_with(&[EOF]) {
            return Err(ProtocolError::PasteCompletionTimeout);
        }
        Ok(())
    }

    /// Send source text for execution without collecting its output.
    ///
    /// Enters raw REPL if needed, drains leftover bytes from any prior
    /// operation (they would corrupt framing), and transfers the source
    /// via the windowed raw-paste path or the paced 256-byte fallback.
    pub async fn exec_raw_no_follow(&mut self, source: &[u8]) -> Result<()> {
        if !self.in_raw_repl {
            self.enter_raw_repl(true).await?;
        }

        self.drain_input().await?;

        // The raw-paste request goes out per execution; only a device
        // that answered "understood but unsupported" is never asked
        // again.
        if self.raw_paste != RawPasteSupport::Unsupported {
            self.transport.write(RAW_PASTE_REQUEST).await?;
            let response = self.read_exact(2).await?;
            match response.as_slice() {
                b"R\x00" => {
                    debug!("raw paste unsupported by device");
                    self.raw_paste = RawPasteSupport::Unsupported;
                }
                b"R\x01" => {
                    self.raw_paste = RawPasteSupport::Supported;
                    return self.raw_paste_write(source).await;
                }
                _ => return Err(ProtocolError::exec_failed(response)),
            }
        }

        // Standard raw REPL: 256 bytes every 10 ms.
        for chunk in source.chunks(FALLBACK_CHUNK) {
            self.transport.write(chunk).await?;
            tokio::time::sleep(READ_TICK).await;
        }
        self.transport.write(&[EOF]).await?;

        let response = self.read_exact(2).await?;
        if response != b"OK" {
            return Err(ProtocolError::exec_failed(response));
        }
        Ok(())
    }

    /// Execute source text and collect both output streams.
    pub async fn exec_raw(
        &mut self,
        source: &[u8],
        consumer: Option<DataConsumer<'_>>,
    ) -> Result<ExecOutput> {
        self.exec_raw_no_follow(source).await?;
        self.follow(self.timeout, consumer).await
    }

    /// Execute source text; remote error output is logged and returned,
    /// not raised.
    pub async fn exec(
        &mut self,
        source: &[u8],
        consumer: Option<DataConsumer<'_>>,
    ) -> Result<ExecOutput> {
        let output = self.exec_raw(source, consumer).await?;
        if !output.success() {
            warn!(
                "remote end reported an error: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(output)
    }

    /// Execute source text, demanding a clean run.
    pub async fn exec_strict(&mut self, source: &[u8]) -> Result<Vec<u8>> {
        self.exec_raw(source, None).await?.into_result()
    }

    /// Evaluate an expression, returning its printed form trimmed.
    pub async fn eval(&mut self, expression: &str) -> Result<Vec<u8>> {
        let out = self
            .exec_strict(format!("print({expression})").as_bytes())
            .await?;
        Ok(trim_ascii(&out).to_vec())
    }

    /// Evaluate an expression and parse its `repr` as a Python literal.
    pub async fn eval_parsed(&mut self, expression: &str) -> Result<Value> {
        let out = self
            .exec_strict(format!("print(repr({expression}))").as_bytes())
            .await?;
        let text = String::from_utf8_lossy(&out);
        Ok(pyliteral::parse(text.trim())?)
    }
}

pub(crate) fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_eof() {
        assert_eq!(strip_eof(b"ab\x04cd\x04"), b"abcd");
        assert_eq!(strip_eof(b""), b"");
    }

    #[test]
    fn test_trim_ascii() {
        assert_eq!(trim_ascii(b"  hi \r\n"), b"hi");
        assert_eq!(trim_ascii(b"\r\n"), b"");
    }

    #[test]
    fn test_exec_output_into_result() {
        let ok = ExecOutput {
            stdout: b"out".to_vec(),
            stderr: Vec::new(),
        };
        assert_eq!(ok.into_result().unwrap(), b"out");

        let err = ExecOutput {
            stdout: b"partial".to_vec(),
            stderr: b"Traceback".to_vec(),
        };
        match err.into_result() {
            Err(ProtocolError::Remote { stdout, stderr }) => {
                assert_eq!(stdout, b"partial");
                assert_eq!(stderr, b"Traceback");
            }
            other => panic!("expected Remote error, got {other:?}"),
        }
    }
}
