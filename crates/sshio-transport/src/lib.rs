//! # sshio transport
//!
//! Session and channel primitives for sshio: a backend-neutral trait layer,
//! the libssh2 backend and an in-memory backend for tests.

#![warn(missing_docs)]

/// Transport abstraction
pub mod transport;

/// SSH-specific error types
pub mod error;

/// libssh2 backend
#[cfg(feature = "ssh2")]
pub mod libssh2;

/// In-memory backend for tests
#[cfg(feature = "mock")]
pub mod mock;

pub use transport::{
    MethodKind, Methods, PtySize, ScpTimes, SftpSession, SshChannel, SshConfig, SshSession,
    TermUnit, Transport, EXTENDED_DATA_STDERR, FLUSH_ALL, FLUSH_EXTENDED_DATA,
    PRIMARY_STREAM,
};
pub use error::{codes, TransportError};

#[cfg(feature = "ssh2")]
pub use libssh2::Libssh2Transport;

#[cfg(feature = "mock")]
pub use mock::{ChannelKind, FailPoint, IoStep, MockChannelHandle, MockRequest, MockTransport};
