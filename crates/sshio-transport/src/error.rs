//! SSH-specific error types

use thiserror::Error;
use std::io;

/// Raw libssh2 result codes that callers need to tell apart
pub mod codes {
    /// Memory allocation failed inside the transport
    pub const ALLOC: i32 = -6;
    /// Sending on the underlying socket failed
    pub const SOCKET_SEND: i32 = -7;
    /// The session-wide timeout expired
    pub const TIMEOUT: i32 = -9;
    /// The remote end closed the channel
    pub const CHANNEL_CLOSED: i32 = -26;
    /// EOF was already sent on the channel
    pub const CHANNEL_EOF_SENT: i32 = -27;
    /// The call would block in non-blocking mode
    pub const EAGAIN: i32 = -37;
}

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// SSH connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote end refused a channel or channel request
    #[error("Channel request failed: {0}")]
    Channel(String),

    /// Negative result from the transport with its last-error text
    #[error("Failure '{message}' ({code})")]
    Session {
        /// Raw transport result code
        code: i32,
        /// Last error message reported by the session
        message: String,
    },

    /// No progress possible without blocking
    #[error("Operation would block")]
    WouldBlock,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The backend does not implement the requested capability
    #[error("Unsupported by transport: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Build an error from a raw transport result code
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        match code {
            codes::EAGAIN => Self::WouldBlock,
            _ => Self::Session { code, message: message.into() },
        }
    }

    /// Raw transport code, when the error carries one
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Session { code, .. } => Some(*code),
            Self::WouldBlock => Some(codes::EAGAIN),
            Self::Timeout => Some(codes::TIMEOUT),
            Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock => Some(codes::EAGAIN),
            _ => None,
        }
    }

    /// Whether this is the non-error "try again" outcome
    pub fn is_would_block(&self) -> bool {
        self.code() == Some(codes::EAGAIN)
    }
}

#[cfg(feature = "ssh2")]
impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        match err.code() {
            ssh2::ErrorCode::Session(code) => Self::from_code(code, err.message()),
            ssh2::ErrorCode::SFTP(code) => Self::Session {
                code,
                message: format!("SFTP: {}", err.message()),
            },
        }
    }
}
