//! Error types for the sshio library

use crate::registry::ResourceId;
use crate::transfer::TransferError;
use sshio_transport::TransportError;
use thiserror::Error;

/// Main error type for sshio operations
#[derive(Debug, Error)]
pub enum SshioError {
    /// The identifier belongs to another scheme or wrapper type
    #[error("Identifier is not handled by this wrapper: {0}")]
    NotMine(String),

    /// The identifier could not be turned into a session
    #[error("Unable to resolve identifier: {0}")]
    Resolve(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A key file failed the access policy
    #[error("Access denied to {0}")]
    AccessDenied(String),

    /// The remote end refused a channel or a channel request
    #[error("Channel error: {0}")]
    Channel(String),

    /// The session handle has not completed authentication
    #[error("Connection not authenticated")]
    NotAuthenticated,

    /// No live registry entry of the expected kind
    #[error("Supplied resource is not a valid {kind} resource: {id}")]
    ResourceNotFound {
        /// Handle that was looked up
        id: ResourceId,
        /// Expected resource kind
        kind: &'static str,
    },

    /// The sub-stream budget of a channel is spent
    #[error("Too many streams associated to a single channel (max {max})")]
    TooManyStreams {
        /// Configured maximum
        max: u16,
    },

    /// Malformed argument from the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stream of another kind was passed where a channel stream was expected
    #[error("Provided stream is not of type {expected}")]
    WrongStreamKind {
        /// Expected stream type name
        expected: &'static str,
    },

    /// Bulk transfer failures
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SshioError {
    /// Whether resolution passed on the identifier rather than failing on it
    pub fn is_not_mine(&self) -> bool {
        matches!(self, Self::NotMine(_))
    }
}

impl From<serde_json::Error> for SshioError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration(format!("JSON error: {}", err))
    }
}
