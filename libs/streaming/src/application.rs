//! # Stream Application
//!
//! Plugs a [`StageGraph`] into an endpoint. One application serves one
//! connection to one remote actor (`peer`): inbound frames are decoded and
//! fed to the graph, graph output addressed to `peer` is encoded into
//! frames, and output for anyone else is handed to the owner as
//! [`StreamEvent::Forward`].
//!
//! Failure grace periods run on the endpoint clock. When a redeployable
//! path fails, a `FailureGrace` timeout is scheduled; if it fires before
//! the path was resumed, the stream is aborted.
//!
//! Owner operations take the [`EndpointContext`] so output can request a
//! write callback, which makes them natural to call through
//! `EndpointManager::with_application`.

use crate::element::StreamElement;
use crate::error::Result as StreamResult;
use crate::event::StreamEvent;
use crate::graph::{OpenRequest, StageGraph};
use bytes::Bytes;
use codec::StreamMessage;
use network::endpoint::{EndpointContext, TimeoutKind};
use network::{Application, Result};
use std::collections::{HashMap, VecDeque};
use streaming_config::StreamSettings;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};
use types::{ActorAddr, ErrorCode, ErrorReason, StreamId, Topic};

/// Stream protocol driver for one endpoint
pub struct StreamApplication {
    peer: ActorAddr,
    graph: StageGraph,
    events: UnboundedSender<StreamEvent>,
    /// Names this endpoint can resolve to actors
    peers: HashMap<String, ActorAddr>,
    /// Messages for `peer` waiting for a write event
    outbox: VecDeque<StreamMessage>,
    grace_timers: HashMap<u64, (StreamId, ActorAddr)>,
}

impl StreamApplication {
    pub fn new(
        local: ActorAddr,
        peer: ActorAddr,
        settings: StreamSettings,
        events: UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            peer,
            graph: StageGraph::new(local, settings, events.clone()),
            events,
            peers: HashMap::new(),
            outbox: VecDeque::new(),
            grace_timers: HashMap::new(),
        }
    }

    /// Topic filter requested on upstream paths opened by `peer`
    pub fn with_filter(mut self, filter: Vec<Topic>) -> Self {
        self.graph = self.graph.with_filter(filter);
        self
    }

    /// Make `name` resolvable through this endpoint
    pub fn add_peer(&mut self, name: impl Into<String>, addr: ActorAddr) {
        self.peers.insert(name.into(), addr);
    }

    pub fn peer(&self) -> ActorAddr {
        self.peer
    }

    pub fn local(&self) -> ActorAddr {
        self.graph.local()
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut StageGraph {
        &mut self.graph
    }

    /// Failure grace timers still waiting to fire
    pub fn pending_grace_timers(&self) -> usize {
        self.grace_timers.len()
    }

    // Owner operations --------------------------------------------------

    /// Open a downstream path from the local actor to `peer`
    pub fn open(
        &mut self,
        ctx: &mut EndpointContext,
        sid: StreamId,
        request: OpenRequest,
    ) -> StreamResult<()> {
        let result = self.graph.open_downstream(sid, self.peer, request);
        self.after_update(ctx);
        result
    }

    pub fn push(
        &mut self,
        ctx: &mut EndpointContext,
        sid: StreamId,
        elements: &[StreamElement],
    ) -> StreamResult<usize> {
        let result = self.graph.push(sid, elements);
        self.after_update(ctx);
        result
    }

    /// Send one batch to `peer` right away; fails if it exceeds credit
    pub fn emit_batch(
        &mut self,
        ctx: &mut EndpointContext,
        sid: StreamId,
        elements: &[StreamElement],
    ) -> StreamResult<i64> {
        let result = self.graph.emit_batch(sid, self.peer, elements);
        self.after_update(ctx);
        result
    }

    pub fn grant_credit(
        &mut self,
        ctx: &mut EndpointContext,
        sid: StreamId,
        new_capacity: i32,
    ) -> StreamResult<()> {
        let result = self.graph.grant_credit(sid, self.peer, new_capacity);
        self.after_update(ctx);
        result
    }

    pub fn close(&mut self, ctx: &mut EndpointContext, sid: StreamId) -> StreamResult<()> {
        let result = self.graph.close(sid);
        self.after_update(ctx);
        result
    }

    pub fn abort(
        &mut self,
        ctx: &mut EndpointContext,
        sid: StreamId,
        reason: ErrorReason,
    ) -> StreamResult<()> {
        let result = self.graph.abort(sid, reason);
        self.after_update(ctx);
        result
    }

    pub fn resume(&mut self, ctx: &mut EndpointContext, sid: StreamId) -> StreamResult<()> {
        let result = self.graph.resume(sid, self.peer);
        self.after_update(ctx);
        result
    }

    // Internals ---------------------------------------------------------

    /// Schedule grace timers for new failures and route graph output
    fn after_update(&mut self, ctx: &mut EndpointContext) {
        let grace = self.graph.settings().failure_grace_period();
        for (sid, peer) in self.graph.drain_new_failures() {
            let id = ctx.schedule_timeout(ctx.now() + grace, TimeoutKind::FailureGrace);
            debug!(handle = %ctx.handle(), %sid, %peer, timeout_id = id, ?grace, "Failure grace timer started");
            self.grace_timers.insert(id, (sid, peer));
        }

        self.route();
        if !self.outbox.is_empty() {
            ctx.register_writing();
        }
    }

    fn route(&mut self) {
        for out in self.graph.take_outgoing() {
            if out.to == self.peer {
                self.outbox.push_back(out.message);
            } else {
                trace!(to = %out.to, sid = %out.message.sid(), "Forwarding message to owner");
                let forward = StreamEvent::Forward {
                    to: out.to,
                    message: out.message,
                };
                if self.events.send(forward).is_err() {
                    debug!("Stream owner gone, dropping forwarded message");
                }
            }
        }
    }
}

impl Application for StreamApplication {
    type TimeoutArgs = (StreamId, ActorAddr);

    fn init(&mut self, ctx: &mut EndpointContext) -> Result<()> {
        info!(handle = %ctx.handle(), local = %self.graph.local(), peer = %self.peer, "Stream endpoint ready");
        Ok(())
    }

    fn handle_data(&mut self, ctx: &mut EndpointContext, frame: &[u8]) -> Result<()> {
        let msg = codec::decode(frame)?;
        if let Err(err) = self.graph.handle_message(self.peer, msg) {
            warn!(
                handle = %ctx.handle(),
                peer = %self.peer,
                kind = %err.kind(),
                error = %err,
                "Stream message rejected"
            );
        }
        self.after_update(ctx);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        self.route();
        match self.outbox.pop_front() {
            Some(msg) => Ok(Some(Self::serialize(&msg)?)),
            None => Ok(None),
        }
    }

    fn has_pending_writes(&self) -> bool {
        !self.outbox.is_empty() || self.graph.has_outgoing()
    }

    fn resolve(&mut self, ctx: &mut EndpointContext, path: &str, listener: ActorAddr) {
        let peer = self.peers.get(path).copied();
        debug!(handle = %ctx.handle(), path, %listener, found = peer.is_some(), "Resolve request");
        let resolved = StreamEvent::Resolved {
            path: path.to_string(),
            listener,
            peer,
        };
        if self.events.send(resolved).is_err() {
            debug!("Stream owner gone, dropping resolve answer");
        }
    }

    fn timeout(&mut self, ctx: &mut EndpointContext, kind: TimeoutKind, id: u64) {
        match kind {
            TimeoutKind::FailureGrace => {
                let Some((sid, peer)) = self.grace_timers.remove(&id) else {
                    debug!(handle = %ctx.handle(), timeout_id = id, "Unknown failure grace timeout");
                    return;
                };
                if !self.graph.escalate(sid, peer) {
                    debug!(%sid, %peer, timeout_id = id, "Path recovered before grace period ended");
                }
                self.after_update(ctx);
            }
            TimeoutKind::Idle => {
                debug!(handle = %ctx.handle(), timeout_id = id, "Idle timeout");
            }
        }
    }

    fn set_timeout(&mut self, id: u64, kind: TimeoutKind, args: Self::TimeoutArgs) {
        match kind {
            TimeoutKind::FailureGrace => {
                self.grace_timers.insert(id, args);
            }
            TimeoutKind::Idle => trace!(timeout_id = id, "Idle timeout armed"),
        }
    }

    fn handle_error(&mut self, code: ErrorCode) {
        warn!(peer = %self.peer, %code, "Endpoint failed, aborting streams");
        self.graph
            .abort_all(ErrorReason::new(code, format!("endpoint to {} failed", self.peer)));
        // Nothing more reaches `peer`; other peers still get their aborts
        self.route();
        self.outbox.clear();
        self.grace_timers.clear();
    }
}
