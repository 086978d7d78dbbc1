//! # Stream Messages - Closed Eight-Variant Protocol
//!
//! A [`StreamMessage`] is `{ sid, content }` where `content` is exactly one of
//! the eight variants below. The set is closed: adding a variant means
//! updating [`VariantTag`], the codec table in `builder`/`parser`, and every
//! path-state transition that matches on [`Content`].
//!
//! | Tag | Variant | Diagnostic name | Purpose |
//! |-----|---------|-----------------|---------|
//! | 1 | [`Open`] | `open` | Starts the handshake for one path |
//! | 2 | [`AckOpen`] | `ok` | Completes the handshake, grants initial credit |
//! | 3 | [`Batch`] | `batch` | Carries elements, consumes credit |
//! | 4 | [`AckBatch`] | `demand` | Cumulative ack plus new credit |
//! | 5 | [`Close`] | `close` | Orderly end of a path |
//! | 6 | [`Abort`] | `abort` | Fatal end of a stream |
//! | 7 | [`DownstreamFailed`] | `downstream_failed` | Runtime-reported downstream loss |
//! | 8 | [`UpstreamFailed`] | `upstream_failed` | Runtime-reported upstream loss |
//!
//! Construction goes through [`make`] (or [`StreamMessage::new`]), which only
//! accepts the eight variant structs: anything else is rejected by the type
//! checker through the sealed [`StreamContent`] trait.

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use types::{ActorAddr, ErrorReason, StreamId, StreamPriority, Topic};

/// Wire tag of each variant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum VariantTag {
    Open = 1,
    AckOpen = 2,
    Batch = 3,
    AckBatch = 4,
    Close = 5,
    Abort = 6,
    DownstreamFailed = 7,
    UpstreamFailed = 8,
}

impl VariantTag {
    /// Stable name used in logs and diagnostics
    pub fn name(self) -> &'static str {
        match self {
            VariantTag::Open => "open",
            VariantTag::AckOpen => "ok",
            VariantTag::Batch => "batch",
            VariantTag::AckBatch => "demand",
            VariantTag::Close => "close",
            VariantTag::Abort => "abort",
            VariantTag::DownstreamFailed => "downstream_failed",
            VariantTag::UpstreamFailed => "upstream_failed",
        }
    }
}

impl fmt::Display for VariantTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Initiates a stream handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    /// Type-erased stream descriptor, used by the receiver to pick a handler
    pub token: Vec<u8>,
    /// Previous stage in the pipeline, if any
    pub prev_stage: Option<ActorAddr>,
    pub priority: StreamPriority,
    /// Offered topics; empty means a single channel
    pub topics: Vec<Topic>,
    /// Whether the path may be rebound after a failure
    pub redeployable: bool,
}

/// Acknowledges an `open` and signals initial demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckOpen {
    /// Credit granted to the source
    pub initial_demand: i32,
    /// Subscribed subset of topics; empty means everything
    pub filter: Vec<Topic>,
    pub redeployable: bool,
}

/// Transmits stream data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Number of elements in `xs`, i.e. the credit this batch consumes
    pub xs_size: i32,
    /// Opaque, already-serialized elements
    pub xs: Vec<u8>,
    /// Ascending, gap-free per path
    pub id: i64,
}

/// Cumulatively acknowledges batches and grants new credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBatch {
    pub new_capacity: i32,
    /// Acknowledges every batch with `id <= acknowledged_id`
    pub acknowledged_id: i64,
}

/// Closes a path after the last batch was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close;

/// Propagates a fatal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub reason: ErrorReason,
}

/// Sent by the runtime when a downstream path failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamFailed {
    pub reason: ErrorReason,
}

/// Sent by the runtime when an upstream path failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamFailed {
    pub reason: ErrorReason,
}

/// Exactly one active variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Open(Open),
    AckOpen(AckOpen),
    Batch(Batch),
    AckBatch(AckBatch),
    Close(Close),
    Abort(Abort),
    DownstreamFailed(DownstreamFailed),
    UpstreamFailed(UpstreamFailed),
}

impl Content {
    pub fn tag(&self) -> VariantTag {
        match self {
            Content::Open(_) => VariantTag::Open,
            Content::AckOpen(_) => VariantTag::AckOpen,
            Content::Batch(_) => VariantTag::Batch,
            Content::AckBatch(_) => VariantTag::AckBatch,
            Content::Close(_) => VariantTag::Close,
            Content::Abort(_) => VariantTag::Abort,
            Content::DownstreamFailed(_) => VariantTag::DownstreamFailed,
            Content::UpstreamFailed(_) => VariantTag::UpstreamFailed,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Implemented by exactly the eight variant structs
pub trait StreamContent: sealed::Sealed + Into<Content> {
    const TAG: VariantTag;

    /// Borrow `Self` out of `content` if it is the active variant
    fn extract(content: &Content) -> Option<&Self>;
}

macro_rules! stream_content {
    ($($ty:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl StreamContent for $ty {
                const TAG: VariantTag = VariantTag::$ty;

                fn extract(content: &Content) -> Option<&Self> {
                    match content {
                        Content::$ty(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Content {
                fn from(inner: $ty) -> Self {
                    Content::$ty(inner)
                }
            }
        )*
    };
}

stream_content!(
    Open,
    AckOpen,
    Batch,
    AckBatch,
    Close,
    Abort,
    DownstreamFailed,
    UpstreamFailed,
);

/// Control or data message for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    sid: StreamId,
    content: Content,
}

impl StreamMessage {
    pub fn new<T: StreamContent>(sid: StreamId, content: T) -> Self {
        Self {
            sid,
            content: content.into(),
        }
    }

    /// Rebuild from already-dispatched parts (used by the decoder)
    pub fn from_parts(sid: StreamId, content: Content) -> Self {
        Self { sid, content }
    }

    pub fn sid(&self) -> StreamId {
        self.sid
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn tag(&self) -> VariantTag {
        self.content.tag()
    }

    /// Typed view of the active variant, `None` if another variant is active
    pub fn get<T: StreamContent>(&self) -> Option<&T> {
        T::extract(&self.content)
    }

    pub fn into_parts(self) -> (StreamId, Content) {
        (self.sid, self.content)
    }
}

impl fmt::Display for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream_msg({}, {})", self.sid, self.tag())
    }
}

/// Build a message for `sid` from one variant's fields
pub fn make<T: StreamContent>(sid: StreamId, content: T) -> StreamMessage {
    StreamMessage::new(sid, content)
}
