//! # Stream Message Codec
//!
//! ## Purpose
//!
//! The "rules" layer of the streaming runtime: the closed set of stream
//! control/data messages and their wire contract.
//!
//! - [`StreamMessage`] / [`Content`]: tagged union over the eight variants
//! - [`make`]: type-checked construction from one variant's fields
//! - [`encode`] / [`decode`]: exact round-trip between messages and frames
//! - [`frame_length`]: frame splitting for byte-stream transports
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → [codec] → libs/network → libs/streaming
//!     ↑           ↓            ↓               ↓
//! StreamId   Frame header   Transports    Credit engine
//! ErrorCode  Bincode body   Endpoints     Stage graph
//! ```
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling (belongs in network/)
//! - Path state or credit accounting (belongs in streaming/)
//! - Serialization of user elements: batch payloads are opaque bytes here

pub mod builder;
pub mod constants;
pub mod error;
pub mod message;
pub mod parser;

pub use builder::{encode, encode_into, SerializeFn};
pub use constants::{FRAME_MAGIC, FRAME_VERSION, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    make, Abort, AckBatch, AckOpen, Batch, Close, Content, DownstreamFailed, Open, StreamContent,
    StreamMessage, UpstreamFailed, VariantTag,
};
pub use parser::{decode, frame_length, parse_header, FrameHeader};
