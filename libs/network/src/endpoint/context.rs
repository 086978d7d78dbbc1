//! Manager state shared with the transport during callbacks

use super::event::TimeoutKind;
use super::handle::EndpointHandle;
use super::queue::EventQueue;
use crate::clock::ActorClock;
use crate::multiplexer::Multiplexer;
use crate::SocketHandle;
use std::sync::Arc;
use std::time::Instant;
use streaming_config::EndpointSettings;
use tracing::debug;

/// Everything of the manager a transport or application may touch
///
/// Passed as `&mut` into every callback. Holds the timeout id counter, so
/// timeouts scheduled from inside a callback and through
/// [`EndpointManager::set_timeout`] share one id space.
///
/// [`EndpointManager::set_timeout`]: super::EndpointManager::set_timeout
pub struct EndpointContext {
    handle: SocketHandle,
    queue: Arc<EventQueue>,
    mpx: Arc<dyn Multiplexer>,
    clock: Arc<dyn ActorClock>,
    next_timeout_id: u64,
    settings: EndpointSettings,
}

impl EndpointContext {
    pub(crate) fn new(
        handle: SocketHandle,
        queue: Arc<EventQueue>,
        mpx: Arc<dyn Multiplexer>,
        clock: Arc<dyn ActorClock>,
        settings: EndpointSettings,
    ) -> Self {
        Self {
            handle,
            queue,
            mpx,
            clock,
            next_timeout_id: 0,
            settings,
        }
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Producer handle for this endpoint's deferred-event queue
    pub fn endpoint_handle(&self) -> EndpointHandle {
        EndpointHandle::new(self.handle, Arc::clone(&self.queue), Arc::clone(&self.mpx))
    }

    pub(crate) fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    /// Id the next scheduled timeout will get
    pub fn next_timeout_id(&self) -> u64 {
        self.next_timeout_id
    }

    /// Register a timeout with the clock and return its id
    ///
    /// Ids count up from zero and are never reused for the lifetime of the
    /// manager.
    pub fn schedule_timeout(&mut self, at: Instant, kind: TimeoutKind) -> u64 {
        let id = self.next_timeout_id;
        self.next_timeout_id += 1;
        self.clock
            .set_multi_timeout(at, self.endpoint_handle(), kind, id);
        debug!(handle = %self.handle, %kind, id, "Timeout scheduled");
        id
    }

    /// Ask the multiplexer for a write callback
    pub fn register_writing(&self) {
        self.mpx.register_writing(self.handle);
    }
}
