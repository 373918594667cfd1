//! Transport selection
//!
//! Parses a connection string into the matching transport:
//!
//! - `exec:<command>`: piped subprocess
//! - `execpty:<command>`: PTY-backed subprocess
//! - a dotted-quad address: telnet
//! - anything else: serial device path

use crate::error::Result;
use crate::pty::PtyTransport;
use crate::serial::SerialTransport;
use crate::subprocess::SubprocessTransport;
use crate::telnet::TelnetTransport;
use crate::traits::Transport;
use std::time::Duration;

/// Configuration for opening a connection
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Serial baud rate
    pub baud_rate: u32,

    /// Telnet login user
    pub user: String,

    /// Telnet login password
    pub password: String,

    /// Telnet negotiation read timeout
    pub read_timeout: Duration,

    /// Extra seconds to wait for a busy serial device
    pub wait: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            user: "micro".to_string(),
            password: "python".to_string(),
            read_timeout: Duration::from_secs(10),
            wait: 0,
        }
    }
}

impl ConnectOptions {
    /// Set the serial baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the telnet credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the serial open wait budget in seconds
    pub fn with_wait(mut self, wait: u32) -> Self {
        self.wait = wait;
        self
    }
}

/// Heuristic from the device string alone: digits at both ends and
/// exactly three dots means an IP address.
fn looks_like_ip(device: &str) -> bool {
    let bytes = device.as_bytes();
    !bytes.is_empty()
        && bytes[0].is_ascii_digit()
        && bytes[bytes.len() - 1].is_ascii_digit()
        && bytes.iter().filter(|&&b| b == b'.').count() == 3
}

/// Open the transport described by `device`.
pub async fn connect(device: &str, options: ConnectOptions) -> Result<Box<dyn Transport>> {
    if let Some(command) = device.strip_prefix("exec:") {
        return Ok(Box::new(SubprocessTransport::spawn(command)?));
    }
    if let Some(command) = device.strip_prefix("execpty:") {
        return Ok(Box::new(PtyTransport::spawn(command)?));
    }
    if looks_like_ip(device) {
        let transport = TelnetTransport::connect(
            device,
            &options.user,
            &options.password,
            options.read_timeout,
        )
        .await?;
        return Ok(Box::new(transport));
    }
    Ok(Box::new(
        SerialTransport::open(device, options.baud_rate, options.wait).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_heuristic() {
        assert!(looks_like_ip("192.168.4.1"));
        assert!(looks_like_ip("10.0.0.2"));
        assert!(!looks_like_ip("/dev/ttyACM0"));
        assert!(!looks_like_ip("COM3"));
        assert!(!looks_like_ip("192.168.4."));
        assert!(!looks_like_ip("1.2.3"));
        assert!(!looks_like_ip(""));
    }

    #[test]
    fn test_options_builder() {
        let options = ConnectOptions::default()
            .with_baud_rate(9600)
            .with_credentials("user", "secret")
            .with_wait(5);
        assert_eq!(options.baud_rate, 9600);
        assert_eq!(options.user, "user");
        assert_eq!(options.password, "secret");
        assert_eq!(options.wait, 5);
    }
}
