//! # In-Memory Transport
//!
//! Byte-stream transport over a pair of shared buffers, for wiring two
//! endpoint managers together in one process. Behaves like a stream socket:
//! writes append raw frame bytes, reads pull at most `read_buffer_size`
//! bytes per event and the receiver re-splits frames with
//! [`codec::frame_length`].

use super::{Application, Transport};
use crate::endpoint::EndpointContext;
use crate::{Result, SocketHandle, TransportError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use types::ErrorCode;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> SocketHandle {
    SocketHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Default)]
struct Pipe {
    buf: BytesMut,
    closed: bool,
}

type SharedPipe = Arc<Mutex<Pipe>>;

/// One end of an in-memory byte stream
pub struct MemoryTransport<A> {
    handle: SocketHandle,
    app: A,
    inbound: SharedPipe,
    outbound: SharedPipe,
    read_buf: BytesMut,
    failed: bool,
}

/// Connect two applications through a pair of in-memory transports
pub fn memory_pair<A, B>(first: A, second: B) -> (MemoryTransport<A>, MemoryTransport<B>)
where
    A: Application,
    B: Application,
{
    let a_to_b = SharedPipe::default();
    let b_to_a = SharedPipe::default();
    (
        MemoryTransport::new(first, Arc::clone(&b_to_a), Arc::clone(&a_to_b)),
        MemoryTransport::new(second, a_to_b, b_to_a),
    )
}

impl<A: Application> MemoryTransport<A> {
    fn new(app: A, inbound: SharedPipe, outbound: SharedPipe) -> Self {
        Self {
            handle: next_handle(),
            app,
            inbound,
            outbound,
            read_buf: BytesMut::new(),
            failed: false,
        }
    }

    /// Append raw bytes as if the peer had written them
    pub fn inject_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().buf.extend_from_slice(bytes);
    }

    /// Close the outgoing direction; the peer sees end-of-stream once drained
    pub fn shutdown(&self) {
        self.outbound.lock().closed = true;
    }

    /// Bytes written but not yet read by the peer
    pub fn unread_outbound(&self) -> usize {
        self.outbound.lock().buf.len()
    }

    /// Bytes from the peer not yet pulled into the read buffer
    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().buf.len()
    }

    fn fail(&mut self, err: &TransportError) {
        error!(handle = %self.handle, category = err.category(), error = %err, "Transport failed");
        self.handle_error(err.code());
    }

    fn process_frames(&mut self, ctx: &mut EndpointContext) -> Result<()> {
        let limit = ctx.settings().max_message_size;
        while let Some(len) = codec::frame_length(&self.read_buf, limit)? {
            let frame = self.read_buf.split_to(len);
            trace!(handle = %self.handle, bytes = len, "Frame received");
            self.app.handle_data(ctx, &frame)?;
        }
        Ok(())
    }
}

impl<A: Application> Transport for MemoryTransport<A> {
    type Application = A;

    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn application(&self) -> &A {
        &self.app
    }

    fn application_mut(&mut self) -> &mut A {
        &mut self.app
    }

    fn init(&mut self, ctx: &mut EndpointContext) -> Result<()> {
        if self.failed {
            return Err(TransportError::init(self.handle, "transport already failed"));
        }
        self.app.init(ctx)
    }

    fn handle_read_event(&mut self, ctx: &mut EndpointContext) -> bool {
        if self.failed {
            return false;
        }

        let (chunk, peer_closed) = {
            let mut pipe = self.inbound.lock();
            let n = pipe.buf.len().min(ctx.settings().read_buffer_size);
            (pipe.buf.split_to(n), pipe.closed && pipe.buf.is_empty())
        };
        self.read_buf.extend_from_slice(&chunk);

        if let Err(err) = self.process_frames(ctx) {
            self.fail(&err);
            return false;
        }

        if peer_closed {
            if !self.read_buf.is_empty() {
                warn!(handle = %self.handle, leftover = self.read_buf.len(), "Peer closed mid-frame");
            }
            let err = TransportError::connection(self.handle, "peer closed the stream");
            self.fail(&err);
            return false;
        }
        true
    }

    fn handle_write_event(&mut self, ctx: &mut EndpointContext) -> bool {
        if self.failed {
            return false;
        }

        let max_frames = ctx.settings().max_frames_per_write;
        let mut written = 0;
        while written < max_frames {
            match self.app.next_frame() {
                Ok(Some(frame)) => {
                    self.outbound.lock().buf.extend_from_slice(&frame);
                    written += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    self.fail(&err);
                    return false;
                }
            }
        }

        if written > 0 {
            trace!(handle = %self.handle, frames = written, "Frames written");
        }
        self.app.has_pending_writes()
    }

    fn handle_error(&mut self, code: ErrorCode) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.read_buf.clear();
        self.outbound.lock().closed = true;
        debug!(handle = %self.handle, %code, "Transport closed");
        self.app.handle_error(code);
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}
