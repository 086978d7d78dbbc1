//! # Streaming Runtime Types
//!
//! Value types shared by every layer of the data-streaming subsystem:
//!
//! - **Identifiers**: [`ActorAddr`] (opaque actor handle) and [`StreamId`]
//!   (one logical stream instance, unique within an actor-system epoch)
//! - **Stream metadata**: [`StreamPriority`] and [`Topic`] tags used by the
//!   `open`/`ack_open` handshake
//! - **Errors**: wire-level [`ErrorCode`]/[`ErrorReason`] carried by `abort` and
//!   `*_failed` messages, and the [`ErrorKind`] taxonomy every crate maps its
//!   own error enum onto
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → libs/codec → libs/network → libs/streaming
//!     ↑             ↓             ↓               ↓
//! Pure values   Wire frames   Endpoint I/O    Paths & credit
//! ```
//!
//! Nothing in this crate performs I/O or owns state; every type is cheap to
//! clone and serializable so the codec can embed it in a frame body.

pub mod errors;
pub mod identifiers;
pub mod priority;

pub use errors::{ErrorCode, ErrorKind, ErrorReason};
pub use identifiers::{ActorAddr, StreamId};
pub use priority::{StreamPriority, Topic};
