//! Transport abstraction for SSH sessions and channels

use crate::TransportError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Stream id of the primary data stream of a channel
pub const PRIMARY_STREAM: i32 = 0;

/// Stream id of the standard error extended data stream
pub const EXTENDED_DATA_STDERR: i32 = 1;

/// Flush id covering every extended data stream
pub const FLUSH_EXTENDED_DATA: i32 = -1;

/// Flush id covering all streams of a channel
pub const FLUSH_ALL: i32 = -2;

/// Opens SSH sessions to remote hosts
pub trait Transport: Send + Sync {
    /// Connect and complete the protocol handshake; no authentication yet
    fn connect(&self, config: &SshConfig) -> Result<Box<dyn SshSession>, TransportError>;
}

/// One SSH connection over one socket
pub trait SshSession: Send + Sync {
    /// Public key authentication from a key pair on disk
    fn userauth_pubkey_file(
        &self,
        username: &str,
        pubkey: &Path,
        privkey: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Password authentication
    fn userauth_password(&self, username: &str, password: &str) -> Result<(), TransportError>;

    /// Whether authentication has completed
    fn authenticated(&self) -> bool;

    /// Switch the session between blocking and non-blocking calls
    fn set_blocking(&self, blocking: bool);

    /// Session-wide timeout for blocking calls, 0 disables it
    fn set_timeout(&self, timeout_ms: u32);

    /// Open a session channel (shell / exec)
    fn channel_session(&self) -> Result<Box<dyn SshChannel>, TransportError>;

    /// Open a direct TCP/IP forwarding channel to `host:port`
    fn channel_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn SshChannel>, TransportError>;

    /// Open an SCP receive channel; returns the channel and the file size
    fn scp_recv(&self, path: &str) -> Result<(Box<dyn SshChannel>, u64), TransportError>;

    /// Open an SCP send channel announcing mode, size and timestamps
    fn scp_send(
        &self,
        path: &str,
        mode: i32,
        size: u64,
        times: Option<ScpTimes>,
    ) -> Result<Box<dyn SshChannel>, TransportError>;

    /// Start the SFTP subsystem on this session
    fn sftp(&self) -> Result<Box<dyn SftpSession>, TransportError>;
}

/// A single channel opened over a session
pub trait SshChannel: Send {
    /// Set a remote environment variable
    fn setenv(&mut self, name: &str, value: &str) -> Result<(), TransportError>;

    /// Request a pseudo-terminal
    fn request_pty(&mut self, term: &str, size: PtySize) -> Result<(), TransportError>;

    /// Request an interactive shell
    fn shell(&mut self) -> Result<(), TransportError>;

    /// Request execution of a command
    fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Blocking mode for subsequent calls on this channel
    fn set_blocking(&mut self, blocking: bool);

    /// Read from logical stream `stream_id`
    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write to logical stream `stream_id`
    fn write_stream(&mut self, stream_id: i32, buf: &[u8]) -> Result<usize, TransportError>;

    /// Flush pending outgoing data for `stream_id` (or [`FLUSH_ALL`])
    fn flush_stream(&mut self, stream_id: i32) -> Result<(), TransportError>;

    /// Whether the remote end has sent EOF
    fn eof(&self) -> bool;

    /// Exit status reported by the remote process
    fn exit_status(&self) -> Result<i32, TransportError>;

    /// Send EOF and wait for the remote end to close the channel
    fn close(&mut self) -> Result<(), TransportError>;
}

/// An SFTP subsystem session layered on an [`SshSession`]
///
/// Directory and attribute operations live outside this crate; consumers
/// downcast through [`SftpSession::as_any`] to reach the backend handle.
pub trait SftpSession: Send + Sync {
    /// Backend specific handle
    fn as_any(&self) -> &dyn Any;
}

/// Algorithm preference slots passed to the key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Key exchange
    Kex,
    /// Host key algorithm
    Hostkey,
    /// Cipher, client to server
    CryptCs,
    /// Cipher, server to client
    CryptSc,
    /// MAC, client to server
    MacCs,
    /// MAC, server to client
    MacSc,
    /// Compression, client to server
    CompCs,
    /// Compression, server to client
    CompSc,
}

/// Method preference lists keyed by slot
pub type Methods = BTreeMap<MethodKind, String>;

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Algorithm preferences
    pub methods: Methods,
    /// Callback names handed to the backend untouched
    pub callbacks: BTreeMap<String, String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            methods: Methods::new(),
            callbacks: BTreeMap::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Unit of pseudo-terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermUnit {
    /// Character cells
    #[default]
    Chars,
    /// Pixels
    Pixels,
}

/// Pseudo-terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    /// Width in `unit`
    pub width: u32,
    /// Height in `unit`
    pub height: u32,
    /// Unit of width and height
    pub unit: TermUnit,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { width: 80, height: 25, unit: TermUnit::Chars }
    }
}

impl PtySize {
    /// Dimensions as `(width_chars, height_chars, width_px, height_px)`
    pub fn dimensions(&self) -> (u32, u32, u32, u32) {
        match self.unit {
            TermUnit::Chars => (self.width, self.height, 0, 0),
            TermUnit::Pixels => (0, 0, self.width, self.height),
        }
    }
}

/// Timestamps announced when sending a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScpTimes {
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    /// Access time, seconds since the epoch
    pub atime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config_default() {
        let config = SshConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 22);
        assert!(config.methods.is_empty());
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_pty_dimensions_by_unit() {
        let chars = PtySize { width: 120, height: 40, unit: TermUnit::Chars };
        assert_eq!(chars.dimensions(), (120, 40, 0, 0));

        let pixels = PtySize { width: 800, height: 600, unit: TermUnit::Pixels };
        assert_eq!(pixels.dimensions(), (0, 0, 800, 600));
    }

    #[test]
    fn test_pty_default_size() {
        let size = PtySize::default();
        assert_eq!((size.width, size.height, size.unit), (80, 25, TermUnit::Chars));
    }

    #[test]
    fn test_method_kind_names() {
        let methods: Methods =
            serde_json::from_str(r#"{"kex": "diffie-hellman-group14-sha1", "crypt_cs": "aes256-ctr"}"#).unwrap();
        assert_eq!(methods.get(&MethodKind::Kex).map(String::as_str), Some("diffie-hellman-group14-sha1"));
        assert_eq!(methods.get(&MethodKind::CryptCs).map(String::as_str), Some("aes256-ctr"));

        let unit: TermUnit = serde_json::from_str(r#""pixels""#).unwrap();
        assert_eq!(unit, TermUnit::Pixels);
    }
}
