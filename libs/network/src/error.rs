//! Transport Error Types
//!
//! Errors raised while driving an endpoint: transport initialisation,
//! connection loss, undecodable input and buffer exhaustion. Every variant
//! is fatal for the endpoint manager that raised it; [`TransportError::kind`]
//! tells the stream layer how to report it to stream owners.

use crate::SocketHandle;
use codec::ProtocolError;
use thiserror::Error;
use types::{ErrorCode, ErrorKind};

/// Main transport error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Transport or application refused to start
    #[error("Initialization failed for {handle}: {message}")]
    Init {
        handle: SocketHandle,
        message: String,
    },

    /// Connection management errors
    #[error("Connection error on {handle}: {message}")]
    Connection {
        handle: SocketHandle,
        message: String,
    },

    /// Operation on an endpoint after `handle_error`
    #[error("Endpoint {handle} is closed")]
    Closed { handle: SocketHandle },

    /// Protocol and deserialization errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Read buffer would exceed its bound
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create an initialization error
    pub fn init(handle: SocketHandle, message: impl Into<String>) -> Self {
        Self::Init {
            handle,
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(handle: SocketHandle, message: impl Into<String>) -> Self {
        Self::Connection {
            handle,
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Taxonomy bucket used when reporting to stream owners
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Protocol(_) => ErrorKind::MalformedMessage,
            _ => ErrorKind::TransportError,
        }
    }

    /// Reason code carried by the `abort` sent for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Protocol(_) => ErrorCode::MalformedMessage,
            TransportError::Init { .. } => ErrorCode::SocketOperationFailed,
            TransportError::Connection { .. } | TransportError::Closed { .. } => {
                ErrorCode::SocketDisconnected
            }
            TransportError::ResourceExhausted { .. } => ErrorCode::SocketOperationFailed,
        }
    }

    /// Get error category for logs
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Init { .. } => "init",
            TransportError::Connection { .. } => "connection",
            TransportError::Closed { .. } => "closed",
            TransportError::Protocol(_) => "protocol",
            TransportError::ResourceExhausted { .. } => "resource_exhausted",
        }
    }
}
