//! Thread-safe proxy for pushing work into an endpoint

use super::event::{DeferredEvent, TimeoutKind};
use super::queue::{EventQueue, PushResult};
use crate::multiplexer::Multiplexer;
use crate::SocketHandle;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use types::ActorAddr;

/// Cloneable producer handle for one endpoint manager
///
/// Actors and the clock never touch the manager directly; they push
/// [`DeferredEvent`]s through this handle. When a push wakes a blocked
/// queue, the handle asks the multiplexer for a write callback so the
/// manager drains it.
#[derive(Clone)]
pub struct EndpointHandle {
    handle: SocketHandle,
    queue: Arc<EventQueue>,
    mpx: Arc<dyn Multiplexer>,
}

impl EndpointHandle {
    pub(crate) fn new(handle: SocketHandle, queue: Arc<EventQueue>, mpx: Arc<dyn Multiplexer>) -> Self {
        Self { handle, queue, mpx }
    }

    pub fn socket(&self) -> SocketHandle {
        self.handle
    }

    /// Ask the endpoint to resolve `path` and report to `listener`
    pub fn resolve(&self, path: impl Into<String>, listener: ActorAddr) -> PushResult {
        self.enqueue(DeferredEvent::ResolveRequest {
            path: path.into(),
            listener,
        })
    }

    /// Deliver a fired clock timeout
    pub fn deliver_timeout(&self, kind: TimeoutKind, id: u64) -> PushResult {
        self.enqueue(DeferredEvent::Timeout { kind, id })
    }

    pub fn enqueue(&self, event: DeferredEvent) -> PushResult {
        let name = event.name();
        let result = self.queue.push(event);
        match result {
            PushResult::UnblockedReader => {
                trace!(handle = %self.handle, event = name, "Woke endpoint reader");
                self.mpx.register_writing(self.handle);
            }
            PushResult::Success => {}
            PushResult::QueueClosed => {
                debug!(handle = %self.handle, event = name, "Dropped event for closed endpoint");
            }
        }
        result
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("handle", &self.handle)
            .field("pending", &self.queue.len())
            .finish()
    }
}
