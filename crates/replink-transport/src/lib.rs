//! Duplex byte-channel abstraction for replink
//!
//! A `Transport` is an opaque duplex byte stream with no protocol
//! knowledge: it can read an exact number of bytes, write bytes, report
//! how many received bytes are waiting, and close. Everything above it
//! (raw-REPL framing, flow control, filesystem snippets) lives in
//! `replink-protocol`.
//!
//! # Architecture
//!
//! - **Transport trait**: generic interface for any byte channel
//! - **Serial**: physical serial port via `serial2`
//! - **Telnet**: telnet-negotiated TCP socket with login handling
//! - **Subprocess**: child process speaking over stdin/stdout pipes
//! - **Pty**: child process attached to a local pseudo-terminal
//!
//! # Usage
//!
//! ```ignore
//! use replink_transport::{connect, ConnectOptions};
//!
//! let transport = connect("/dev/ttyACM0", ConnectOptions::default()).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod error;
pub mod factory;
pub mod pty;
pub mod serial;
pub mod subprocess;
pub mod telnet;
pub mod traits;

// Re-export commonly used types
pub use buffer::ChannelBuffer;
pub use error::{Result, TransportError};
pub use factory::{ConnectOptions, connect};
pub use pty::PtyTransport;
pub use serial::SerialTransport;
pub use subprocess::SubprocessTransport;
pub use telnet::TelnetTransport;
pub use traits::Transport;
