//! Notifications delivered to the stream owner

use crate::element::StreamElement;
use crate::error::StreamError;
use codec::StreamMessage;
use types::{ActorAddr, ErrorKind, StreamId, StreamPriority, Topic};

/// Everything a stage reports to the actor that owns it
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A peer opened an upstream path to us
    Opened {
        sid: StreamId,
        peer: ActorAddr,
        token: Vec<u8>,
        prev_stage: Option<ActorAddr>,
        priority: StreamPriority,
        topics: Vec<Topic>,
    },
    /// Handshake on a downstream path completed
    PathActive {
        sid: StreamId,
        peer: ActorAddr,
        initial_demand: i32,
    },
    /// Elements received on an upstream path
    Elements {
        sid: StreamId,
        from: ActorAddr,
        elements: Vec<StreamElement>,
    },
    /// A path closed in order
    Closed { sid: StreamId, peer: ActorAddr },
    /// A redeployable path failed and waits for a resume
    Failed {
        sid: StreamId,
        peer: ActorAddr,
        error: StreamError,
    },
    /// A failed path was resumed or redeployed
    Resumed { sid: StreamId, peer: ActorAddr },
    /// The stream was torn down
    Fatal { sid: StreamId, error: StreamError },
    /// Answer to a resolve request
    Resolved {
        path: String,
        listener: ActorAddr,
        peer: Option<ActorAddr>,
    },
    /// Message for a peer this endpoint does not reach; route it elsewhere
    Forward { to: ActorAddr, message: StreamMessage },
}

impl StreamEvent {
    pub fn sid(&self) -> Option<StreamId> {
        match self {
            StreamEvent::Opened { sid, .. }
            | StreamEvent::PathActive { sid, .. }
            | StreamEvent::Elements { sid, .. }
            | StreamEvent::Closed { sid, .. }
            | StreamEvent::Failed { sid, .. }
            | StreamEvent::Resumed { sid, .. }
            | StreamEvent::Fatal { sid, .. } => Some(*sid),
            StreamEvent::Forward { message, .. } => Some(message.sid()),
            StreamEvent::Resolved { .. } => None,
        }
    }

    /// Error classification for failure events
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            StreamEvent::Failed { error, .. } | StreamEvent::Fatal { error, .. } => {
                Some(error.kind())
            }
            _ => None,
        }
    }
}
