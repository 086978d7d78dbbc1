//! # Endpoint Multiplexing
//!
//! ## Purpose
//!
//! Binds the stream protocol to asynchronous transport I/O. One
//! [`EndpointManager`] owns one transport (which in turn owns one
//! application) and interleaves three kinds of work on it without ever
//! blocking the thread that drives it:
//!
//! - read readiness, forwarded to the transport
//! - write readiness, which first drains deferred events, then writes
//! - deferred events (timeouts and resolve requests) pushed from any thread
//!
//! ## Architecture Role
//!
//! ```text
//!   actor threads ──push──► EventQueue ──drain (DRR)──┐
//!   ActorClock ──timeout──► EndpointHandle            │
//!                                                     ▼
//!   Multiplexer ──ready──► EndpointManager ──► Transport ──► Application
//!                           (ctx: clock,        (bytes)       (frames)
//!                            timeout ids)
//! ```
//!
//! The manager is generic over the [`Transport`] capability, so the same
//! queueing and timeout logic drives a socket, a datagram channel or the
//! in-memory [`MemoryTransport`] used in tests.
//!
//! ## What This Crate Does NOT Contain
//! - The readiness loop itself: a [`Multiplexer`] is an external collaborator
//! - Stream state, credit or path logic (belongs in streaming/)

pub mod clock;
pub mod endpoint;
pub mod error;
pub mod multiplexer;
pub mod transports;

use std::fmt;

pub use clock::{ActorClock, ManualClock, TokioClock};
pub use endpoint::{
    DeferredEvent, DrrQueue, EndpointContext, EndpointHandle, EndpointManager, EventQueue,
    PushResult, TimeoutKind,
};
pub use error::{Result, TransportError};
pub use multiplexer::{Multiplexer, ReadinessSet};
pub use transports::{memory_pair, Application, MemoryTransport, Transport};

/// Identifies one endpoint towards its multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}
