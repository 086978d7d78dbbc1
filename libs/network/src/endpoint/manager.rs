//! # Endpoint Manager
//!
//! Owns one transport and bridges it to the multiplexer, the actor clock and
//! the deferred-event queue.
//!
//! ## Write Event Handling
//!
//! ```text
//! handle_write_event
//!   ├─ queue unblocked and non-empty?
//!   │    loop {
//!   │      fetch_more → DRR cache
//!   │      inc_deficit(total task size)
//!   │      drain: resolve_request → transport.resolve
//!   │             timeout         → transport.timeout
//!   │    } until try_block()
//!   └─ transport.handle_write_event
//! ```
//!
//! After [`EndpointManager::handle_error`], or once the transport reports
//! that it failed by itself, the queue is closed and every further callback
//! is a logged no-op.

use super::context::EndpointContext;
use super::event::{DeferredEvent, TaskWeights, TimeoutKind};
use super::handle::EndpointHandle;
use super::queue::{DrrQueue, EventQueue};
use crate::clock::ActorClock;
use crate::multiplexer::Multiplexer;
use crate::transports::{Application, Transport};
use crate::{Result, SocketHandle, TransportError};
use codec::SerializeFn;
use std::sync::Arc;
use std::time::Instant;
use streaming_config::EndpointSettings;
use tracing::{debug, error, info, trace, warn};
use types::ErrorCode;

/// Multiplexes one transport's I/O, timeouts and deferred work
pub struct EndpointManager<T: Transport> {
    transport: T,
    ctx: EndpointContext,
    drr: DrrQueue,
    failed: bool,
}

impl<T: Transport> EndpointManager<T> {
    pub fn new(
        transport: T,
        mpx: Arc<dyn Multiplexer>,
        clock: Arc<dyn ActorClock>,
        settings: EndpointSettings,
    ) -> Self {
        let handle = transport.handle();
        let weights = TaskWeights {
            timeout: settings.timeout_task_size,
            resolve: settings.resolve_task_size,
        };
        let queue = Arc::new(EventQueue::new(weights));
        Self {
            transport,
            ctx: EndpointContext::new(handle, queue, mpx, clock, settings),
            drr: DrrQueue::new(),
            failed: false,
        }
    }

    /// Initialize the transport; on error the caller tears the manager down
    pub fn init(&mut self) -> Result<()> {
        if self.failed {
            return Err(TransportError::Closed {
                handle: self.handle(),
            });
        }
        let result = self.transport.init(&mut self.ctx);
        self.sync_transport_failure();
        match result {
            Ok(()) => {
                info!(handle = %self.handle(), "Endpoint initialized");
                Ok(())
            }
            Err(e) => {
                error!(handle = %self.handle(), error = %e, "Endpoint initialization failed");
                Err(e)
            }
        }
    }

    /// Returns whether to stay registered for read readiness
    pub fn handle_read_event(&mut self) -> bool {
        if self.failed {
            warn!(handle = %self.handle(), "Read event on failed endpoint");
            return false;
        }
        let keep_reading = self.transport.handle_read_event(&mut self.ctx);
        keep_reading && !self.sync_transport_failure()
    }

    /// Drain deferred events, then let the transport write
    ///
    /// Returns whether writes are still pending.
    pub fn handle_write_event(&mut self) -> bool {
        if self.failed {
            warn!(handle = %self.handle(), "Write event on failed endpoint");
            return false;
        }

        let queue = self.ctx.queue();
        if !queue.blocked() && !queue.is_empty() {
            loop {
                queue.fetch_more(&mut self.drr);
                self.drr.inc_deficit(self.drr.total_task_size());
                while let Some(event) = self.drr.next() {
                    self.dispatch(event);
                    if self.sync_transport_failure() {
                        return false;
                    }
                }
                if queue.try_block() {
                    break;
                }
            }
        }

        let pending = self.transport.handle_write_event(&mut self.ctx);
        pending && !self.sync_transport_failure()
    }

    fn dispatch(&mut self, event: DeferredEvent) {
        trace!(handle = %self.handle(), event = event.name(), "Dispatching deferred event");
        match event {
            DeferredEvent::ResolveRequest { path, listener } => {
                self.transport.resolve(&mut self.ctx, &path, listener);
            }
            DeferredEvent::Timeout { kind, id } => {
                self.transport.timeout(&mut self.ctx, kind, id);
            }
        }
    }

    /// Fatal condition: notify the transport and stop accepting work
    pub fn handle_error(&mut self, code: ErrorCode) {
        if self.failed {
            debug!(handle = %self.handle(), %code, "Endpoint already failed");
            return;
        }
        self.failed = true;
        let dropped = self.ctx.queue().close();
        warn!(handle = %self.handle(), %code, dropped, "Endpoint failed");
        self.transport.handle_error(code);
    }

    /// Adopt a failure the transport ran into by itself
    ///
    /// The transport already notified its application; this only stops the
    /// manager. Returns whether the manager is failed.
    fn sync_transport_failure(&mut self) -> bool {
        if !self.failed && self.transport.is_failed() {
            self.failed = true;
            let dropped = self.ctx.queue().close();
            warn!(handle = %self.handle(), dropped, "Transport failed, closing endpoint");
        }
        self.failed
    }

    /// Schedule a timeout and hand its data to the transport
    ///
    /// Returns the timeout id; ids are never repeated by one manager.
    pub fn set_timeout(
        &mut self,
        at: Instant,
        kind: TimeoutKind,
        args: <T::Application as Application>::TimeoutArgs,
    ) -> u64 {
        let id = self.ctx.schedule_timeout(at, kind);
        self.transport.set_timeout(id, kind, args);
        id
    }

    /// Application-level encoder, usable without naming the application type
    pub fn serialize_fun(&self) -> SerializeFn {
        <T::Application as Application>::serialize
    }

    pub fn handle(&self) -> SocketHandle {
        self.ctx.handle()
    }

    /// Producer handle for resolve requests and timeouts
    pub fn endpoint_handle(&self) -> EndpointHandle {
        self.ctx.endpoint_handle()
    }

    pub fn next_timeout_id(&self) -> u64 {
        self.ctx.next_timeout_id()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn context(&self) -> &EndpointContext {
        &self.ctx
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn application(&self) -> &T::Application {
        self.transport.application()
    }

    pub fn application_mut(&mut self) -> &mut T::Application {
        self.transport.application_mut()
    }

    /// Run `f` against the application with access to the context, e.g. to
    /// queue output and request a write callback
    pub fn with_application<R>(
        &mut self,
        f: impl FnOnce(&mut T::Application, &mut EndpointContext) -> R,
    ) -> R {
        f(self.transport.application_mut(), &mut self.ctx)
    }
}
