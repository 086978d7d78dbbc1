//! Stream-level errors
//!
//! [`StreamError::kind`] maps every variant onto the shared taxonomy so owners
//! can tell "abort and report" from "wait for resume" without matching on
//! the concrete variant.

use crate::path::PathState;
use codec::ProtocolError;
use thiserror::Error;
use types::{ActorAddr, ErrorCode, ErrorKind, ErrorReason, StreamId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    /// Batch larger than the credit granted for its path
    #[error("Credit violation on {sid}: {requested} elements exceed available credit {available}")]
    CreditViolation {
        sid: StreamId,
        requested: i32,
        available: i32,
    },

    /// Stream torn down by an abort or a non-redeployable failure
    #[error("Stream {sid} failed fatally: {reason}")]
    Fatal { sid: StreamId, reason: ErrorReason },

    /// Redeployable path failed and waits for a resume
    #[error("Path {sid} -> {peer} failed: {reason}")]
    PathFailed {
        sid: StreamId,
        peer: ActorAddr,
        reason: ErrorReason,
    },

    #[error("Invalid path transition on {sid}: {from} -> {to}")]
    InvalidTransition {
        sid: StreamId,
        from: PathState,
        to: PathState,
    },

    /// Message the path's current state cannot accept
    #[error("Unexpected {message} on {sid} in state {state}")]
    UnexpectedMessage {
        sid: StreamId,
        message: &'static str,
        state: PathState,
    },

    #[error("Batch sequence gap on {sid}: expected id {expected}, got {got}")]
    SequenceGap {
        sid: StreamId,
        expected: i64,
        got: i64,
    },

    #[error("Unknown stream {sid}")]
    UnknownStream { sid: StreamId },

    #[error("No path on {sid} to {peer}")]
    UnknownPath { sid: StreamId, peer: ActorAddr },

    #[error("Path on {sid} to {peer} already exists")]
    DuplicatePath { sid: StreamId, peer: ActorAddr },

    /// Batch payload could not be packed or unpacked
    #[error("Element codec failed on {sid}: {reason}")]
    Element { sid: StreamId, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::CreditViolation { .. } => ErrorKind::CreditViolation,
            StreamError::Fatal { .. } => ErrorKind::StreamFatal,
            StreamError::PathFailed { .. } => ErrorKind::RecoverablePathFailure,
            StreamError::Element { .. } | StreamError::Protocol(_) => ErrorKind::MalformedMessage,
            StreamError::InvalidTransition { .. }
            | StreamError::UnexpectedMessage { .. }
            | StreamError::SequenceGap { .. }
            | StreamError::UnknownStream { .. }
            | StreamError::UnknownPath { .. }
            | StreamError::DuplicatePath { .. } => ErrorKind::InvalidState,
        }
    }

    /// Reason code used when this error aborts a stream
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::CreditViolation { .. } => ErrorCode::CreditViolation,
            StreamError::Fatal { reason, .. } | StreamError::PathFailed { reason, .. } => {
                reason.code
            }
            StreamError::Element { .. } | StreamError::Protocol(_) => ErrorCode::MalformedMessage,
            _ => ErrorCode::InvalidStreamState,
        }
    }

    pub fn sid(&self) -> Option<StreamId> {
        match self {
            StreamError::CreditViolation { sid, .. }
            | StreamError::Fatal { sid, .. }
            | StreamError::PathFailed { sid, .. }
            | StreamError::InvalidTransition { sid, .. }
            | StreamError::UnexpectedMessage { sid, .. }
            | StreamError::SequenceGap { sid, .. }
            | StreamError::UnknownStream { sid }
            | StreamError::UnknownPath { sid, .. }
            | StreamError::DuplicatePath { sid, .. }
            | StreamError::Element { sid, .. } => Some(*sid),
            StreamError::Protocol(_) => None,
        }
    }
}
