//! Raw-REPL protocol driver for replink
//!
//! Implements the control protocol spoken by a MicroPython interpreter
//! over any [`replink_transport::Transport`]:
//!
//! - **Session**: interrupt/reset, raw-REPL entry and exit, source
//!   execution with raw-paste flow control and two 0x04-terminated
//!   output streams per execution
//! - **Filesystem operations**: list/stat/read/write/copy/remove built
//!   entirely on `Session::exec` by generating interpreter snippets and
//!   parsing their printed output
//! - **pyliteral**: parser for the Python literal subset the device
//!   prints (the printed-`repr` wire format of the filesystem layer)
//!
//! Remote program errors are data, not faults: `exec` returns both
//! output streams and the caller decides what a non-empty error stream
//! means. Protocol framing violations, by contrast, are fatal to the
//! in-flight operation and are never retried here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fs;
pub mod pyliteral;
pub mod session;

// Re-export commonly used types
pub use error::{ProtocolError, Result};
pub use fs::{DEFAULT_CHUNK, DEFAULT_PUT_CHUNK, DirEntry, FileStat, ProgressFn};
pub use session::{DataConsumer, ExecOutput, RawPasteSupport, Session, strip_eof};
