//! Error codes and the shared error taxonomy
//!
//! [`ErrorCode`] + [`ErrorReason`] travel on the wire inside `abort`,
//! `downstream_failed` and `upstream_failed`. [`ErrorKind`] never travels: it
//! classifies local errors so callers can decide between "report and abort",
//! "wait for resume" and "tear down the endpoint" without matching on every
//! crate's concrete error enum.

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason codes for stream and socket failures
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No more specific code applies
    Unexpected = 1,
    /// A message arrived that the path's current state cannot accept
    InvalidStreamState = 2,
    /// The stream could not be established
    StreamInitFailed = 3,
    /// Stream owner terminated the stream
    UnhandledStreamError = 4,
    /// The remote node became unreachable
    RemoteLinkUnreachable = 5,
    /// Peer closed the socket
    SocketDisconnected = 6,
    /// Socket read/write failed
    SocketOperationFailed = 7,
    /// Bytes on the wire could not be decoded
    MalformedMessage = 8,
    /// More elements were sent than credit allowed
    CreditViolation = 9,
    /// A redeployable path was not resumed in time
    Timeout = 10,
    /// The runtime is shutting down
    RuntimeShutdown = 11,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Unexpected => "unexpected",
            ErrorCode::InvalidStreamState => "invalid_stream_state",
            ErrorCode::StreamInitFailed => "stream_init_failed",
            ErrorCode::UnhandledStreamError => "unhandled_stream_error",
            ErrorCode::RemoteLinkUnreachable => "remote_link_unreachable",
            ErrorCode::SocketDisconnected => "socket_disconnected",
            ErrorCode::SocketOperationFailed => "socket_operation_failed",
            ErrorCode::MalformedMessage => "malformed_message",
            ErrorCode::CreditViolation => "credit_violation",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RuntimeShutdown => "runtime_shutdown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error code plus free-form context, the payload of terminal messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorReason {
    pub code: ErrorCode,
    pub context: String,
}

impl ErrorReason {
    pub fn new(code: ErrorCode, context: impl Into<String>) -> Self {
        Self {
            code,
            context: context.into(),
        }
    }

    /// Reason without context
    pub fn code(code: ErrorCode) -> Self {
        Self::new(code, String::new())
    }
}

impl From<ErrorCode> for ErrorReason {
    fn from(code: ErrorCode) -> Self {
        Self::code(code)
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.context)
        }
    }
}

/// Error taxonomy shared by the codec, network and streaming crates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wire bytes failed to decode; connection-fatal
    MalformedMessage,
    /// Local attempt to send beyond granted credit; a programming defect
    CreditViolation,
    /// Non-redeployable failure or explicit abort; the path is destroyed
    StreamFatal,
    /// Redeployable path failure; waits for an external resume
    RecoverablePathFailure,
    /// Transport failure; fatal for the whole endpoint
    TransportError,
    /// Message not acceptable in the path's current state
    InvalidState,
}

impl ErrorKind {
    /// Whether the error leaves room for recovery without tearing anything down
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::RecoverablePathFailure | ErrorKind::InvalidState)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::CreditViolation => "credit_violation",
            ErrorKind::StreamFatal => "stream_fatal",
            ErrorKind::RecoverablePathFailure => "recoverable_path_failure",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::InvalidState => "invalid_state",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
