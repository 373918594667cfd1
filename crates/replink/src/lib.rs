//! # replink
//!
//! Control client for MicroPython boards over a shared port. One
//! process owns the connection; everything else goes through it:
//!
//! - [`Arbiter`]: owns the transport, drains unsolicited device output
//!   to subscribers, and arbitrates access with a two-strength
//!   cooperative lock
//! - [`Dispatcher`]: verb-level requests (`ls`, `cat`, `put`, `exec`,
//!   ...) executed as locked raw-REPL operations
//! - re-exported [`protocol`] and [`transport`] crates for callers that
//!   need to drive a session directly
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use replink::{Action, Arbiter, ConnectOptions, Dispatcher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let arbiter = Arc::new(Arbiter::new());
//!     arbiter.open("/dev/ttyACM0", ConnectOptions::default()).await?;
//!
//!     let mut dispatcher = Dispatcher::new(arbiter.clone());
//!     let listing = dispatcher
//!         .dispatch(Action::Ls { path: String::new() })
//!         .await?;
//!     println!("{listing:?}");
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod arbiter;
pub mod dispatcher;
pub mod error;

// Re-export commonly used types
pub use arbiter::{Arbiter, LockStrength, PortEvent, PortGuard, SubscriptionId};
pub use dispatcher::{Action, ActionOutput, Dispatcher};
pub use error::{ClientError, Result};

// Re-export the lower layers under stable names
pub use replink_protocol as protocol;
pub use replink_transport as transport;
pub use replink_transport::{ConnectOptions, Transport};

/// Install a stderr tracing subscriber honoring `RUST_LOG`.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
