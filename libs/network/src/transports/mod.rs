//! # Transport Capability
//!
//! An endpoint manager drives exactly one [`Transport`], which owns exactly
//! one [`Application`]. The transport moves bytes and splits them into
//! frames; the application turns frames into stream messages and back.
//!
//! ```text
//! EndpointManager ──events──► Transport ──frames──► Application
//!        ▲                        │                      │
//!        └──── EndpointContext ───┴──────────────────────┘
//!              (timeouts, write interest, settings)
//! ```
//!
//! Both traits receive the manager's [`EndpointContext`] on every callback
//! instead of a back-reference to the manager, so neither side ever
//! aliases the other's state.

use crate::endpoint::{EndpointContext, TimeoutKind};
use crate::{Result, SocketHandle};
use bytes::Bytes;
use codec::{ProtocolResult, StreamMessage};
use types::{ActorAddr, ErrorCode};

pub mod memory;

pub use memory::{memory_pair, MemoryTransport};

/// Byte-level I/O capability driven by an endpoint manager
pub trait Transport: Send {
    type Application: Application;

    /// Handle the multiplexer knows this transport by
    fn handle(&self) -> SocketHandle;

    fn application(&self) -> &Self::Application;

    fn application_mut(&mut self) -> &mut Self::Application;

    /// Prepare the transport and its application; failure is fatal
    fn init(&mut self, ctx: &mut EndpointContext) -> Result<()>;

    /// Returns whether the endpoint stays registered for reading
    fn handle_read_event(&mut self, ctx: &mut EndpointContext) -> bool;

    /// Returns whether writes are still pending
    fn handle_write_event(&mut self, ctx: &mut EndpointContext) -> bool;

    /// Fatal condition; no further I/O callbacks follow
    fn handle_error(&mut self, code: ErrorCode);

    /// Whether the transport has failed, including on its own during a
    /// read or write
    fn is_failed(&self) -> bool {
        false
    }

    fn resolve(&mut self, ctx: &mut EndpointContext, path: &str, listener: ActorAddr) {
        self.application_mut().resolve(ctx, path, listener);
    }

    fn timeout(&mut self, ctx: &mut EndpointContext, kind: TimeoutKind, id: u64) {
        self.application_mut().timeout(ctx, kind, id);
    }

    /// Record type-specific data for timeout `id`
    fn set_timeout(
        &mut self,
        id: u64,
        kind: TimeoutKind,
        args: <Self::Application as Application>::TimeoutArgs,
    ) {
        self.application_mut().set_timeout(id, kind, args);
    }
}

/// Frame-level protocol logic plugged into a transport
pub trait Application: Send {
    /// Data attached to a timeout when it is scheduled
    type TimeoutArgs;

    fn init(&mut self, ctx: &mut EndpointContext) -> Result<()>;

    /// Consume one complete frame; an error is fatal for the endpoint
    fn handle_data(&mut self, ctx: &mut EndpointContext, frame: &[u8]) -> Result<()>;

    /// Next encoded frame to write, if any
    fn next_frame(&mut self) -> Result<Option<Bytes>>;

    fn has_pending_writes(&self) -> bool;

    fn resolve(&mut self, ctx: &mut EndpointContext, path: &str, listener: ActorAddr);

    fn timeout(&mut self, ctx: &mut EndpointContext, kind: TimeoutKind, id: u64);

    fn set_timeout(&mut self, id: u64, kind: TimeoutKind, args: Self::TimeoutArgs);

    fn handle_error(&mut self, code: ErrorCode);

    /// Encoder for this application's messages
    fn serialize(msg: &StreamMessage) -> ProtocolResult<Bytes> {
        codec::encode(msg)
    }
}
