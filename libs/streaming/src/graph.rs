//! # Stage Graph
//!
//! The local actor's view of every stream it takes part in. A [`Stage`] is
//! keyed by stream id and holds at most one upstream path (where batches
//! come from) and any number of downstream paths (where batches go). A
//! stage with both is a relay: received elements are forwarded downstream.
//!
//! ## Message Flow
//!
//! ```text
//! handle_message(from, msg) ──► Stage / Path state machine
//!                                    │
//!                     ┌──────────────┼───────────────┐
//!                     ▼              ▼               ▼
//!               outbox (to peers)  StreamEvent   new failures
//!               take_outgoing()    (owner chan)  (grace timers)
//! ```
//!
//! The graph never performs I/O. Replies and relays are queued as
//! [`Outgoing`] messages; owner notifications go to an unbounded tokio
//! channel.
//!
//! ## Failure Handling
//!
//! - `abort` from any peer closes every path of the stage, relays a fresh
//!   `abort` to all other peers and reports [`StreamEvent::Fatal`]
//! - `downstream_failed`/`upstream_failed` on a redeployable path parks it
//!   in `Failed` until [`StageGraph::resume`], or until the grace period
//!   runs out ([`StageGraph::escalate`], [`StageGraph::expire_failed`])
//! - the same failure on a non-redeployable path is handled like `abort`
//! - a sink-side sequence gap, credit overrun or undecodable batch aborts
//!   the stream

use crate::credit::AckOutcome;
use crate::element::{self, StreamElement};
use crate::error::{Result, StreamError};
use crate::event::StreamEvent;
use crate::path::{Direction, Path, PathState};
use codec::{
    make, Abort, AckBatch, AckOpen, Batch, Close, Content, Open, StreamContent, StreamMessage,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use streaming_config::StreamSettings;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};
use types::{ActorAddr, ErrorCode, ErrorKind, ErrorReason, StreamId, StreamPriority, Topic};

/// Message queued for delivery to a peer
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: ActorAddr,
    pub message: StreamMessage,
}

/// Parameters of a locally initiated downstream path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub token: Vec<u8>,
    pub priority: StreamPriority,
    pub topics: Vec<Topic>,
    pub redeployable: bool,
}

impl OpenRequest {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
            priority: StreamPriority::default(),
            topics: Vec::new(),
            redeployable: false,
        }
    }

    pub fn redeployable(mut self, redeployable: bool) -> Self {
        self.redeployable = redeployable;
        self
    }

    pub fn priority(mut self, priority: StreamPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }
}

/// All paths of one stream at the local actor
#[derive(Debug, Clone)]
pub struct Stage {
    sid: StreamId,
    upstream: Option<Path>,
    downstreams: Vec<Path>,
    closing: bool,
}

impl Stage {
    fn new(sid: StreamId) -> Self {
        Self {
            sid,
            upstream: None,
            downstreams: Vec::new(),
            closing: false,
        }
    }

    pub fn sid(&self) -> StreamId {
        self.sid
    }

    pub fn upstream(&self) -> Option<&Path> {
        self.upstream.as_ref()
    }

    pub fn downstreams(&self) -> &[Path] {
        &self.downstreams
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Upstream path followed by downstream paths
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.upstream.iter().chain(self.downstreams.iter())
    }

    pub fn path(&self, peer: ActorAddr) -> Option<&Path> {
        self.paths().find(|p| p.peer() == peer)
    }

    fn path_mut(&mut self, peer: ActorAddr) -> Option<&mut Path> {
        self.upstream
            .iter_mut()
            .chain(self.downstreams.iter_mut())
            .find(|p| p.peer() == peer)
    }

    fn upstream_from(&mut self, peer: ActorAddr) -> Option<&mut Path> {
        self.upstream.as_mut().filter(|p| p.peer() == peer)
    }

    fn downstream_mut(&mut self, peer: ActorAddr) -> Option<&mut Path> {
        self.downstreams.iter_mut().find(|p| p.peer() == peer)
    }

    fn remove_path(&mut self, peer: ActorAddr) -> Option<Path> {
        if self.upstream.as_ref().map(|p| p.peer()) == Some(peer) {
            return self.upstream.take();
        }
        let idx = self.downstreams.iter().position(|p| p.peer() == peer)?;
        Some(self.downstreams.remove(idx))
    }

    fn peers(&self) -> Vec<ActorAddr> {
        self.paths().map(|p| p.peer()).collect()
    }

    fn is_empty(&self) -> bool {
        self.upstream.is_none() && self.downstreams.is_empty()
    }
}

fn queue<T: StreamContent>(
    outbox: &mut VecDeque<Outgoing>,
    to: ActorAddr,
    sid: StreamId,
    content: T,
) {
    let message = make(sid, content);
    trace!(%sid, %to, variant = message.tag().name(), "Queued stream message");
    outbox.push_back(Outgoing { to, message });
}

fn emit(events: &UnboundedSender<StreamEvent>, event: StreamEvent) {
    if events.send(event).is_err() {
        debug!("Stream owner gone, dropping event");
    }
}

/// Path/stage state for every stream of one local actor
pub struct StageGraph {
    local: ActorAddr,
    settings: StreamSettings,
    /// Topic filter requested from sources in `ack_open`
    filter: Vec<Topic>,
    stages: BTreeMap<StreamId, Stage>,
    outbox: VecDeque<Outgoing>,
    events: UnboundedSender<StreamEvent>,
    new_failures: Vec<(StreamId, ActorAddr)>,
}

impl StageGraph {
    pub fn new(
        local: ActorAddr,
        settings: StreamSettings,
        events: UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            local,
            settings,
            filter: Vec::new(),
            stages: BTreeMap::new(),
            outbox: VecDeque::new(),
            events,
            new_failures: Vec::new(),
        }
    }

    /// Filter requested on every upstream path opened from now on
    pub fn with_filter(mut self, filter: Vec<Topic>) -> Self {
        self.filter = filter;
        self
    }

    pub fn local(&self) -> ActorAddr {
        self.local
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn stage(&self, sid: StreamId) -> Option<&Stage> {
        self.stages.get(&sid)
    }

    pub fn path(&self, sid: StreamId, peer: ActorAddr) -> Option<&Path> {
        self.stages.get(&sid)?.path(peer)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn pop_outgoing(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.outbox.drain(..).collect()
    }

    /// Paths that entered `Failed` since the last call
    pub fn drain_new_failures(&mut self) -> Vec<(StreamId, ActorAddr)> {
        std::mem::take(&mut self.new_failures)
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Register a downstream path in `Pending`
    pub fn add_downstream(
        &mut self,
        sid: StreamId,
        peer: ActorAddr,
        priority: StreamPriority,
        redeployable: bool,
    ) -> Result<()> {
        let stage = self.stages.entry(sid).or_insert_with(|| Stage::new(sid));
        if stage.path(peer).is_some() {
            return Err(StreamError::DuplicatePath { sid, peer });
        }
        stage
            .downstreams
            .push(Path::downstream(sid, peer, priority, redeployable));
        debug!(%sid, %peer, "Downstream path added");
        Ok(())
    }

    /// Send `open` on a pending downstream path
    pub fn send_open(
        &mut self,
        sid: StreamId,
        peer: ActorAddr,
        token: Vec<u8>,
        topics: Vec<Topic>,
    ) -> Result<()> {
        let stage = self
            .stages
            .get_mut(&sid)
            .ok_or(StreamError::UnknownStream { sid })?;
        let prev_stage = stage.upstream.as_ref().map(|p| p.peer());
        let path = stage
            .downstream_mut(peer)
            .ok_or(StreamError::UnknownPath { sid, peer })?;
        path.transition(PathState::Open)?;

        let open = Open {
            token,
            prev_stage,
            priority: path.priority(),
            topics,
            redeployable: path.redeployable(),
        };
        queue(&mut self.outbox, peer, sid, open);
        info!(%sid, %peer, "Downstream path opening");
        Ok(())
    }

    /// Add a downstream path and open it in one step
    pub fn open_downstream(
        &mut self,
        sid: StreamId,
        peer: ActorAddr,
        request: OpenRequest,
    ) -> Result<()> {
        self.add_downstream(sid, peer, request.priority, request.redeployable)?;
        self.send_open(sid, peer, request.token, request.topics)
    }

    /// Queue elements on every downstream path and send what credit allows
    ///
    /// Returns the number of (element, path) pairs queued after filtering.
    pub fn push(&mut self, sid: StreamId, elements: &[StreamElement]) -> Result<usize> {
        let stage = self
            .stages
            .get_mut(&sid)
            .ok_or(StreamError::UnknownStream { sid })?;
        if stage.closing {
            return Err(StreamError::UnexpectedMessage {
                sid,
                message: "elements",
                state: PathState::Closing,
            });
        }
        let queued = stage
            .downstreams
            .iter_mut()
            .filter(|p| p.accepts_elements())
            .map(|p| p.enqueue(elements))
            .sum();
        self.flush(sid)?;
        Ok(queued)
    }

    /// Send one batch directly, bypassing the element buffer
    ///
    /// A batch larger than the path's credit is refused with
    /// [`StreamError::CreditViolation`] and nothing is sent.
    pub fn emit_batch(
        &mut self,
        sid: StreamId,
        peer: ActorAddr,
        elements: &[StreamElement],
    ) -> Result<i64> {
        let stage = self
            .stages
            .get_mut(&sid)
            .ok_or(StreamError::UnknownStream { sid })?;
        let path = stage
            .downstream_mut(peer)
            .ok_or(StreamError::UnknownPath { sid, peer })?;
        if !path.can_send() {
            return Err(StreamError::UnexpectedMessage {
                sid,
                message: "batch",
                state: path.state(),
            });
        }

        let xs = element::pack(sid, elements)?;
        let xs_size = elements.len() as i32;
        let credit = path.outbound_mut().ok_or(StreamError::UnexpectedMessage {
            sid,
            message: "batch",
            state: PathState::Active,
        })?;
        let id = credit.reserve(sid, xs_size).map_err(|e| {
            error!(%sid, %peer, error = %e, "Refusing batch beyond credit");
            e
        })?;
        queue(&mut self.outbox, peer, sid, Batch { xs_size, xs, id });
        Ok(id)
    }

    /// Grant credit to an upstream source by hand
    ///
    /// Needed when `credit_refill` is off; acknowledges every batch
    /// received so far.
    pub fn grant_credit(&mut self, sid: StreamId, peer: ActorAddr, new_capacity: i32) -> Result<()> {
        let stage = self
            .stages
            .get_mut(&sid)
            .ok_or(StreamError::UnknownStream { sid })?;
        let path = stage
            .upstream_from(peer)
            .ok_or(StreamError::UnknownPath { sid, peer })?;
        if path.state() != PathState::Active {
            return Err(StreamError::UnexpectedMessage {
                sid,
                message: "ack_batch",
                state: path.state(),
            });
        }
        if let Some(credit) = path.inbound_mut() {
            let ack = credit.acknowledge(new_capacity);
            queue(&mut self.outbox, peer, sid, ack);
        }
        Ok(())
    }

    /// Close the stage, draining downstream paths first
    ///
    /// Active downstream paths move to `Closing` and get their `close` once
    /// every buffered element is sent and every batch acknowledged. Paths
    /// that never completed the handshake close immediately, as does the
    /// upstream path.
    pub fn close(&mut self, sid: StreamId) -> Result<()> {
        let stage = self
            .stages
            .get_mut(&sid)
            .ok_or(StreamError::UnknownStream { sid })?;
        stage.closing = true;

        let mut closed_now = Vec::new();
        for path in stage.downstreams.iter_mut() {
            match path.state() {
                PathState::Active => path.transition(PathState::Closing)?,
                PathState::Pending => path.close(),
                PathState::Open | PathState::Failed => {
                    path.close();
                    closed_now.push(path.peer());
                }
                PathState::Closing | PathState::Closed => {}
            }
        }
        stage.downstreams.retain(|p| !p.is_closed());

        if let Some(mut upstream) = stage.upstream.take() {
            upstream.close();
            closed_now.push(upstream.peer());
        }

        for peer in closed_now {
            queue(&mut self.outbox, peer, sid, Close);
            emit(&self.events, StreamEvent::Closed { sid, peer });
        }
        info!(%sid, "Stage closing");
        self.flush(sid)
    }

    /// Abort the stage locally, notifying every peer
    pub fn abort(&mut self, sid: StreamId, reason: ErrorReason) -> Result<()> {
        if !self.stages.contains_key(&sid) {
            return Err(StreamError::UnknownStream { sid });
        }
        self.abort_stage(sid, None, reason);
        Ok(())
    }

    /// Abort every stage, e.g. after the transport failed
    pub fn abort_all(&mut self, reason: ErrorReason) {
        let sids: Vec<StreamId> = self.stages.keys().copied().collect();
        if !sids.is_empty() {
            warn!(streams = sids.len(), %reason, "Aborting all streams");
        }
        for sid in sids {
            self.abort_stage(sid, None, reason.clone());
        }
    }

    /// Return a failed redeployable path to `Active`, or to `Closing` if it
    /// was draining
    pub fn resume(&mut self, sid: StreamId, peer: ActorAddr) -> Result<()> {
        let stage = self
            .stages
            .get_mut(&sid)
            .ok_or(StreamError::UnknownStream { sid })?;
        let path = stage
            .path_mut(peer)
            .ok_or(StreamError::UnknownPath { sid, peer })?;
        path.resume()?;
        self.new_failures.retain(|f| *f != (sid, peer));
        info!(%sid, %peer, "Path resumed");
        emit(&self.events, StreamEvent::Resumed { sid, peer });
        self.flush(sid)
    }

    /// Turn a still-failed path into a fatal stream error
    ///
    /// Returns `false` if the path was resumed or is gone already.
    pub fn escalate(&mut self, sid: StreamId, peer: ActorAddr) -> bool {
        let original = match self.path(sid, peer) {
            Some(path) if path.state() == PathState::Failed => path
                .failure()
                .map(|(reason, _)| reason.to_string())
                .unwrap_or_default(),
            _ => return false,
        };
        let reason = ErrorReason::new(
            ErrorCode::Timeout,
            format!(
                "not resumed within {:?} after {}",
                self.settings.failure_grace_period(),
                original
            ),
        );
        warn!(%sid, %peer, %reason, "Failure grace period expired");
        self.abort_stage(sid, Some(peer), reason);
        true
    }

    /// Escalate every failed path whose grace period ended by `now`
    pub fn expire_failed(&mut self, now: Instant) -> usize {
        let grace = self.settings.failure_grace_period();
        let expired: Vec<(StreamId, ActorAddr)> = self
            .stages
            .values()
            .flat_map(|stage| stage.paths())
            .filter(|p| p.state() == PathState::Failed)
            .filter(|p| p.failure().map_or(false, |(_, at)| *at + grace <= now))
            .map(|p| (p.sid(), p.peer()))
            .collect();
        expired
            .into_iter()
            .filter(|(sid, peer)| self.escalate(*sid, *peer))
            .count()
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    /// Apply one message received from `from`
    ///
    /// Errors are also logged; fatal ones have already aborted the stream
    /// and queued the resulting `abort` messages when this returns.
    pub fn handle_message(&mut self, from: ActorAddr, msg: StreamMessage) -> Result<()> {
        let (sid, content) = msg.into_parts();
        trace!(%sid, %from, variant = content.tag().name(), "Stream message received");
        match content {
            Content::Open(open) => self.on_open(sid, from, open),
            Content::AckOpen(ack) => self.on_ack_open(sid, from, ack),
            Content::Batch(batch) => self.on_batch(sid, from, batch),
            Content::AckBatch(ack) => self.on_ack_batch(sid, from, ack),
            Content::Close(_) => self.on_close(sid, from),
            Content::Abort(abort) => self.on_abort(sid, from, abort.reason),
            Content::DownstreamFailed(failed) => {
                self.on_path_failed(sid, from, failed.reason, "downstream_failed")
            }
            Content::UpstreamFailed(failed) => {
                self.on_path_failed(sid, from, failed.reason, "upstream_failed")
            }
        }
    }

    fn on_open(&mut self, sid: StreamId, from: ActorAddr, open: Open) -> Result<()> {
        let demand = self.settings.default_initial_demand;
        let stage = self.stages.entry(sid).or_insert_with(|| Stage::new(sid));

        if let Some(upstream) = stage.upstream.as_mut() {
            if upstream.peer() == from
                && upstream.state() == PathState::Failed
                && upstream.redeployable()
            {
                upstream.redeploy(demand)?;
                self.new_failures.retain(|f| *f != (sid, from));
                let ack = AckOpen {
                    initial_demand: demand,
                    filter: self.filter.clone(),
                    redeployable: true,
                };
                queue(&mut self.outbox, from, sid, ack);
                info!(%sid, peer = %from, "Upstream path redeployed");
                emit(&self.events, StreamEvent::Resumed { sid, peer: from });
                return Ok(());
            }
            let state = upstream.state();
            warn!(%sid, peer = %from, %state, "Ignoring open on stage with an upstream path");
            return Err(StreamError::UnexpectedMessage {
                sid,
                message: "open",
                state,
            });
        }
        if let Some(existing) = stage.path(from) {
            let state = existing.state();
            warn!(%sid, peer = %from, %state, "Ignoring open from a downstream peer");
            return Err(StreamError::UnexpectedMessage {
                sid,
                message: "open",
                state,
            });
        }

        let mut path = Path::upstream(sid, from, open.priority, open.redeployable, demand);
        path.transition(PathState::Open)?;
        path.transition(PathState::Active)?;
        stage.upstream = Some(path);

        let ack = AckOpen {
            initial_demand: demand,
            filter: self.filter.clone(),
            redeployable: open.redeployable,
        };
        queue(&mut self.outbox, from, sid, ack);
        info!(%sid, peer = %from, priority = %open.priority, demand, "Upstream path opened");
        emit(
            &self.events,
            StreamEvent::Opened {
                sid,
                peer: from,
                token: open.token,
                prev_stage: open.prev_stage,
                priority: open.priority,
                topics: open.topics,
            },
        );
        Ok(())
    }

    fn on_ack_open(&mut self, sid: StreamId, from: ActorAddr, ack: AckOpen) -> Result<()> {
        let Some(stage) = self.stages.get_mut(&sid) else {
            warn!(%sid, peer = %from, "Ignoring ack_open for unknown stream");
            return Err(StreamError::UnknownStream { sid });
        };
        let Some(path) = stage.downstream_mut(from) else {
            warn!(%sid, peer = %from, "Ignoring ack_open without downstream path");
            return Err(StreamError::UnknownPath { sid, peer: from });
        };
        if path.state() != PathState::Open {
            let state = path.state();
            warn!(%sid, peer = %from, %state, "Ignoring ack_open outside handshake");
            return Err(StreamError::UnexpectedMessage {
                sid,
                message: "ack_open",
                state,
            });
        }

        let initial_demand = ack.initial_demand;
        path.activate(initial_demand, ack.filter, ack.redeployable)?;
        info!(%sid, peer = %from, initial_demand, "Downstream path active");
        emit(
            &self.events,
            StreamEvent::PathActive {
                sid,
                peer: from,
                initial_demand,
            },
        );
        self.flush(sid)
    }

    fn on_batch(&mut self, sid: StreamId, from: ActorAddr, batch: Batch) -> Result<()> {
        let refill = self.settings.credit_refill;
        let outcome = {
            let Some(stage) = self.stages.get_mut(&sid) else {
                warn!(%sid, peer = %from, "Ignoring batch for unknown stream");
                return Err(StreamError::UnknownStream { sid });
            };
            let Some(path) = stage.upstream_from(from) else {
                warn!(%sid, peer = %from, "Ignoring batch without upstream path");
                return Err(StreamError::UnknownPath { sid, peer: from });
            };
            let state = path.state();
            let Some(credit) = path.inbound_mut().filter(|_| state == PathState::Active) else {
                warn!(%sid, peer = %from, %state, "Ignoring batch outside active state");
                return Err(StreamError::UnexpectedMessage {
                    sid,
                    message: "batch",
                    state,
                });
            };
            credit
                .accept(sid, &batch)
                .and_then(|()| element::unpack(sid, &batch.xs, batch.xs_size))
                .map(|elements| {
                    let ack = refill.then(|| credit.acknowledge(batch.xs_size));
                    (elements, ack)
                })
        };

        let (elements, ack) = match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%sid, peer = %from, batch_id = batch.id, error = %err, "Rejecting batch");
                let code = if err.kind() == ErrorKind::MalformedMessage {
                    ErrorCode::MalformedMessage
                } else {
                    ErrorCode::InvalidStreamState
                };
                self.abort_stage(sid, None, ErrorReason::new(code, err.to_string()));
                return Err(err);
            }
        };

        trace!(%sid, peer = %from, batch_id = batch.id, elements = elements.len(), "Batch accepted");
        if let Some(ack) = ack {
            queue(&mut self.outbox, from, sid, ack);
        }

        let relayed = match self.stages.get_mut(&sid) {
            Some(stage) if !stage.downstreams.is_empty() => {
                for path in stage.downstreams.iter_mut().filter(|p| p.accepts_elements()) {
                    path.enqueue(&elements);
                }
                true
            }
            _ => false,
        };
        emit(
            &self.events,
            StreamEvent::Elements {
                sid,
                from,
                elements,
            },
        );
        if relayed {
            self.flush(sid)?;
        }
        Ok(())
    }

    fn on_ack_batch(&mut self, sid: StreamId, from: ActorAddr, ack: AckBatch) -> Result<()> {
        let outcome = {
            let Some(stage) = self.stages.get_mut(&sid) else {
                warn!(%sid, peer = %from, "Ignoring ack_batch for unknown stream");
                return Err(StreamError::UnknownStream { sid });
            };
            let Some(path) = stage.downstream_mut(from) else {
                warn!(%sid, peer = %from, "Ignoring ack_batch without downstream path");
                return Err(StreamError::UnknownPath { sid, peer: from });
            };
            let state = path.state();
            match path.outbound_mut() {
                Some(credit) if matches!(state, PathState::Active | PathState::Closing) => {
                    credit.apply_ack(sid, &ack)
                }
                _ => {
                    warn!(%sid, peer = %from, %state, "Ignoring ack_batch outside active state");
                    return Err(StreamError::UnexpectedMessage {
                        sid,
                        message: "ack_batch",
                        state,
                    });
                }
            }
        };

        match outcome {
            AckOutcome::Applied {
                newly_acked,
                credit,
            } => {
                trace!(%sid, peer = %from, acknowledged_id = ack.acknowledged_id, newly_acked, credit, "Batches acknowledged");
                self.flush(sid)
            }
            // Logged by the credit engine; duplicates are harmless
            AckOutcome::Stale | AckOutcome::Unsent | AckOutcome::InvalidCapacity => Ok(()),
        }
    }

    fn on_close(&mut self, sid: StreamId, from: ActorAddr) -> Result<()> {
        let Some(stage) = self.stages.get_mut(&sid) else {
            warn!(%sid, peer = %from, "Ignoring close for unknown stream");
            return Err(StreamError::UnknownStream { sid });
        };
        let Some(mut path) = stage.remove_path(from) else {
            warn!(%sid, peer = %from, "Ignoring close without path");
            return Err(StreamError::UnknownPath { sid, peer: from });
        };
        path.close();
        let relay = path.direction() == Direction::Upstream && !stage.downstreams.is_empty();

        info!(%sid, peer = %from, "Path closed by peer");
        emit(&self.events, StreamEvent::Closed { sid, peer: from });
        if relay {
            self.close(sid)
        } else {
            self.prune(sid);
            Ok(())
        }
    }

    fn on_abort(&mut self, sid: StreamId, from: ActorAddr, reason: ErrorReason) -> Result<()> {
        if !self.stages.contains_key(&sid) {
            warn!(%sid, peer = %from, %reason, "Ignoring abort for unknown stream");
            return Err(StreamError::UnknownStream { sid });
        }
        self.abort_stage(sid, Some(from), reason);
        Ok(())
    }

    fn on_path_failed(
        &mut self,
        sid: StreamId,
        from: ActorAddr,
        reason: ErrorReason,
        variant: &'static str,
    ) -> Result<()> {
        let recoverable = {
            let Some(stage) = self.stages.get_mut(&sid) else {
                warn!(%sid, peer = %from, variant, "Ignoring failure for unknown stream");
                return Err(StreamError::UnknownStream { sid });
            };
            let Some(path) = stage.path_mut(from) else {
                warn!(%sid, peer = %from, variant, "Ignoring failure without path");
                return Err(StreamError::UnknownPath { sid, peer: from });
            };
            if path.state() == PathState::Failed {
                debug!(%sid, peer = %from, variant, "Path already failed");
                return Ok(());
            }
            if path.redeployable() && path.state() != PathState::Pending {
                path.fail(reason.clone(), Instant::now())?;
                true
            } else {
                false
            }
        };

        if recoverable {
            warn!(%sid, peer = %from, %reason, variant, "Redeployable path failed, waiting for resume");
            self.new_failures.push((sid, from));
            emit(
                &self.events,
                StreamEvent::Failed {
                    sid,
                    peer: from,
                    error: StreamError::PathFailed {
                        sid,
                        peer: from,
                        reason,
                    },
                },
            );
        } else {
            self.abort_stage(sid, Some(from), reason);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Send whatever buffered elements credit allows, then finish closing paths
    fn flush(&mut self, sid: StreamId) -> Result<()> {
        let max_batch = self.settings.max_batch_size;
        let Some(stage) = self.stages.get_mut(&sid) else {
            return Ok(());
        };

        for path in stage.downstreams.iter_mut() {
            loop {
                let elements = path.take_sendable(max_batch);
                if elements.is_empty() {
                    break;
                }
                let xs = element::pack(sid, &elements)?;
                let xs_size = elements.len() as i32;
                let peer = path.peer();
                let Some(credit) = path.outbound_mut() else {
                    break;
                };
                let id = credit.reserve(sid, xs_size)?;
                queue(&mut self.outbox, peer, sid, Batch { xs_size, xs, id });
            }
        }

        self.finish_closing(sid);
        Ok(())
    }

    /// Emit `close` on drained closing paths and drop the stage once empty
    fn finish_closing(&mut self, sid: StreamId) {
        let Some(stage) = self.stages.get_mut(&sid) else {
            return;
        };

        let mut closed = Vec::new();
        stage.downstreams.retain_mut(|path| {
            if path.state() == PathState::Closing && path.is_drained() {
                path.close();
                closed.push(path.peer());
                false
            } else {
                true
            }
        });

        for peer in closed {
            queue(&mut self.outbox, peer, sid, Close);
            info!(%sid, %peer, "Downstream path drained and closed");
            emit(&self.events, StreamEvent::Closed { sid, peer });
        }
        self.prune(sid);
    }

    fn prune(&mut self, sid: StreamId) {
        if self.stages.get(&sid).map_or(false, Stage::is_empty) {
            self.stages.remove(&sid);
            debug!(%sid, "Stage removed");
        }
    }

    /// Close every path of the stage and relay `abort` to every peer except `except`
    fn abort_stage(&mut self, sid: StreamId, except: Option<ActorAddr>, reason: ErrorReason) {
        let Some(mut stage) = self.stages.remove(&sid) else {
            return;
        };
        let peers = stage.peers();
        if let Some(upstream) = stage.upstream.as_mut() {
            upstream.close();
        }
        for path in stage.downstreams.iter_mut() {
            path.close();
        }

        for peer in peers.into_iter().filter(|p| Some(*p) != except) {
            queue(
                &mut self.outbox,
                peer,
                sid,
                Abort {
                    reason: reason.clone(),
                },
            );
        }
        self.new_failures.retain(|(s, _)| *s != sid);

        warn!(%sid, %reason, "Stream aborted");
        emit(
            &self.events,
            StreamEvent::Fatal {
                sid,
                error: StreamError::Fatal { sid, reason },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{DownstreamFailed, UpstreamFailed};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const SOURCE: u128 = 1;
    const SINK: u128 = 2;
    const NEXT: u128 = 3;

    fn addr(n: u128) -> ActorAddr {
        ActorAddr::from_u128(n)
    }

    fn sid() -> StreamId {
        StreamId::new(addr(SOURCE), 7)
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            default_initial_demand: 10,
            ..Default::default()
        }
    }

    fn graph(local: u128) -> (StageGraph, UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StageGraph::new(addr(local), settings(), tx), rx)
    }

    fn events(rx: &mut UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn elements(n: usize) -> Vec<StreamElement> {
        (0..n).map(|i| StreamElement::new(vec![i as u8])).collect()
    }

    fn tags(out: &[Outgoing]) -> Vec<(&'static str, ActorAddr)> {
        out.iter().map(|o| (o.message.tag().name(), o.to)).collect()
    }

    /// Source with an active downstream path to SINK holding `demand` credit
    fn active_source(demand: i32, redeployable: bool) -> (StageGraph, UnboundedReceiver<StreamEvent>) {
        let (mut g, mut rx) = graph(SOURCE);
        g.open_downstream(sid(), addr(SINK), OpenRequest::new(b"ints".to_vec()).redeployable(redeployable))
            .unwrap();
        g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckOpen {
                    initial_demand: demand,
                    filter: vec![],
                    redeployable,
                },
            ),
        )
        .unwrap();
        g.take_outgoing();
        events(&mut rx);
        (g, rx)
    }

    fn credit(g: &StageGraph) -> i32 {
        g.path(sid(), addr(SINK))
            .and_then(|p| p.outbound())
            .map(|c| c.credit_available())
            .unwrap()
    }

    #[test]
    fn test_open_handshake() {
        let (mut g, mut rx) = graph(SOURCE);
        g.open_downstream(
            sid(),
            addr(SINK),
            OpenRequest::new(b"ints".to_vec()).priority(StreamPriority::High),
        )
        .unwrap();

        let out = g.take_outgoing();
        let open = out[0].message.get::<Open>().unwrap();
        assert_eq!(open.priority, StreamPriority::High);
        assert_eq!(open.prev_stage, None);
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().state(), PathState::Open);

        g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckOpen {
                    initial_demand: 10,
                    filter: vec![],
                    redeployable: false,
                },
            ),
        )
        .unwrap();
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().state(), PathState::Active);
        assert_eq!(
            events(&mut rx),
            vec![StreamEvent::PathActive {
                sid: sid(),
                peer: addr(SINK),
                initial_demand: 10
            }]
        );

        // A second ack_open is out of protocol
        let again = g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckOpen {
                    initial_demand: 10,
                    filter: vec![],
                    redeployable: false,
                },
            ),
        );
        assert_eq!(again.unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_credit_exhaustion_then_refill() {
        let (mut g, _rx) = active_source(10, false);

        assert_eq!(g.emit_batch(sid(), addr(SINK), &elements(4)).unwrap(), 0);
        assert_eq!(g.emit_batch(sid(), addr(SINK), &elements(6)).unwrap(), 1);
        assert_eq!(credit(&g), 0);

        let err = g.emit_batch(sid(), addr(SINK), &elements(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CreditViolation);
        assert_eq!(g.take_outgoing().len(), 2);

        g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckBatch {
                    new_capacity: 4,
                    acknowledged_id: 1,
                },
            ),
        )
        .unwrap();
        assert_eq!(credit(&g), 4);
        let path = g.path(sid(), addr(SINK)).unwrap();
        assert_eq!(path.outbound().unwrap().highest_acked_id(), 1);

        assert_eq!(g.emit_batch(sid(), addr(SINK), &elements(4)).unwrap(), 2);
        let out = g.take_outgoing();
        assert_eq!(out[0].message.get::<Batch>().unwrap().xs_size, 4);
    }

    #[test]
    fn test_duplicate_ack_changes_credit_once() {
        let (mut g, _rx) = active_source(10, false);
        g.emit_batch(sid(), addr(SINK), &elements(5)).unwrap();

        let ack = make(
            sid(),
            AckBatch {
                new_capacity: 5,
                acknowledged_id: 0,
            },
        );
        g.handle_message(addr(SINK), ack.clone()).unwrap();
        g.handle_message(addr(SINK), ack).unwrap();
        assert_eq!(credit(&g), 10);
    }

    #[test]
    fn test_non_redeployable_failure_is_fatal() {
        let (mut g, mut rx) = active_source(10, false);

        g.handle_message(
            addr(SINK),
            make(
                sid(),
                DownstreamFailed {
                    reason: ErrorCode::RemoteLinkUnreachable.into(),
                },
            ),
        )
        .unwrap();

        assert!(g.path(sid(), addr(SINK)).is_none());
        assert!(g.is_empty());
        let evs = events(&mut rx);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].error_kind(), Some(ErrorKind::StreamFatal));
        // The failed peer is not sent an abort
        assert!(g.take_outgoing().is_empty());

        // No message is accepted afterwards
        let late = g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckBatch {
                    new_capacity: 1,
                    acknowledged_id: 0,
                },
            ),
        );
        assert!(matches!(late, Err(StreamError::UnknownStream { .. })));
    }

    #[test]
    fn test_redeployable_failure_resume_and_expiry() {
        let (mut g, mut rx) = active_source(2, true);

        g.handle_message(
            addr(SINK),
            make(
                sid(),
                DownstreamFailed {
                    reason: ErrorCode::RemoteLinkUnreachable.into(),
                },
            ),
        )
        .unwrap();
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().state(), PathState::Failed);
        assert_eq!(g.drain_new_failures(), vec![(sid(), addr(SINK))]);
        let evs = events(&mut rx);
        assert_eq!(evs[0].error_kind(), Some(ErrorKind::RecoverablePathFailure));

        // Elements pushed while failed wait in the buffer
        g.push(sid(), &elements(3)).unwrap();
        assert!(g.take_outgoing().is_empty());

        g.resume(sid(), addr(SINK)).unwrap();
        let out = g.take_outgoing();
        assert_eq!(tags(&out), vec![("batch", addr(SINK))]);
        assert_eq!(out[0].message.get::<Batch>().unwrap().xs_size, 2);
        assert_eq!(
            events(&mut rx),
            vec![StreamEvent::Resumed {
                sid: sid(),
                peer: addr(SINK)
            }]
        );

        // Second failure is not resumed in time
        g.handle_message(
            addr(SINK),
            make(
                sid(),
                DownstreamFailed {
                    reason: ErrorCode::RemoteLinkUnreachable.into(),
                },
            ),
        )
        .unwrap();
        events(&mut rx);
        assert_eq!(g.expire_failed(Instant::now()), 0);

        let late = Instant::now() + g.settings().failure_grace_period() + std::time::Duration::from_millis(1);
        assert_eq!(g.expire_failed(late), 1);
        assert!(g.is_empty());
        match &events(&mut rx)[..] {
            [StreamEvent::Fatal {
                error: StreamError::Fatal { reason, .. },
                ..
            }] => assert_eq!(reason.code, ErrorCode::Timeout),
            other => panic!("Expected fatal event, got {:?}", other),
        }
        assert!(!g.escalate(sid(), addr(SINK)));
    }

    #[test]
    fn test_drain_then_close() {
        let (mut g, mut rx) = active_source(2, false);
        g.push(sid(), &elements(5)).unwrap();
        assert_eq!(tags(&g.take_outgoing()), vec![("batch", addr(SINK))]);

        g.close(sid()).unwrap();
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().state(), PathState::Closing);
        assert!(g.push(sid(), &elements(1)).is_err());

        for acked in 0..2 {
            g.handle_message(
                addr(SINK),
                make(
                    sid(),
                    AckBatch {
                        new_capacity: 2,
                        acknowledged_id: acked,
                    },
                ),
            )
            .unwrap();
            assert_eq!(tags(&g.take_outgoing()), vec![("batch", addr(SINK))]);
        }

        // Last batch sent but unacknowledged: still no close
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().buffered(), 0);
        assert!(!g.has_outgoing());

        g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckBatch {
                    new_capacity: 2,
                    acknowledged_id: 2,
                },
            ),
        )
        .unwrap();
        assert_eq!(tags(&g.take_outgoing()), vec![("close", addr(SINK))]);
        assert!(g.is_empty());
        assert_eq!(
            events(&mut rx),
            vec![StreamEvent::Closed {
                sid: sid(),
                peer: addr(SINK)
            }]
        );
    }

    #[test]
    fn test_failure_during_drain_still_closes_after_resume() {
        let (mut g, mut rx) = active_source(2, true);
        g.push(sid(), &elements(2)).unwrap();
        assert_eq!(tags(&g.take_outgoing()), vec![("batch", addr(SINK))]);

        g.close(sid()).unwrap();
        g.handle_message(
            addr(SINK),
            make(
                sid(),
                DownstreamFailed {
                    reason: ErrorCode::RemoteLinkUnreachable.into(),
                },
            ),
        )
        .unwrap();
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().state(), PathState::Failed);

        g.resume(sid(), addr(SINK)).unwrap();
        assert_eq!(g.path(sid(), addr(SINK)).unwrap().state(), PathState::Closing);
        // Batch 0 is still unacknowledged
        assert!(!g.has_outgoing());
        events(&mut rx);

        g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckBatch {
                    new_capacity: 0,
                    acknowledged_id: 0,
                },
            ),
        )
        .unwrap();
        assert_eq!(tags(&g.take_outgoing()), vec![("close", addr(SINK))]);
        assert!(g.is_empty());
        assert_eq!(
            events(&mut rx),
            vec![StreamEvent::Closed {
                sid: sid(),
                peer: addr(SINK)
            }]
        );
    }

    #[test]
    fn test_filter_drops_unmatched_elements() {
        let (mut g, _rx) = graph(SOURCE);
        g.open_downstream(sid(), addr(SINK), OpenRequest::new(vec![])).unwrap();
        g.handle_message(
            addr(SINK),
            make(
                sid(),
                AckOpen {
                    initial_demand: 10,
                    filter: vec![Topic::from("a")],
                    redeployable: false,
                },
            ),
        )
        .unwrap();
        g.take_outgoing();

        let queued = g
            .push(
                sid(),
                &[
                    StreamElement::tagged("a", vec![1]),
                    StreamElement::tagged("b", vec![2]),
                    StreamElement::new(vec![3]),
                ],
            )
            .unwrap();
        assert_eq!(queued, 1);

        let out = g.take_outgoing();
        let batch = out[0].message.get::<Batch>().unwrap();
        assert_eq!(batch.xs_size, 1);
        assert_eq!(credit(&g), 9);
    }

    #[test]
    fn test_sink_acks_and_reports_elements() {
        let (mut g, mut rx) = graph(SINK);
        g.handle_message(
            addr(SOURCE),
            make(
                sid(),
                Open {
                    token: b"ints".to_vec(),
                    prev_stage: None,
                    priority: StreamPriority::Normal,
                    topics: vec![],
                    redeployable: false,
                },
            ),
        )
        .unwrap();
        let out = g.take_outgoing();
        assert_eq!(out[0].message.get::<AckOpen>().unwrap().initial_demand, 10);
        assert!(matches!(events(&mut rx).as_slice(), [StreamEvent::Opened { .. }]));

        let xs = element::pack(sid(), &elements(3)).unwrap();
        g.handle_message(addr(SOURCE), make(sid(), Batch { xs_size: 3, xs, id: 0 }))
            .unwrap();

        let out = g.take_outgoing();
        assert_eq!(
            out[0].message.get::<AckBatch>(),
            Some(&AckBatch {
                new_capacity: 3,
                acknowledged_id: 0
            })
        );
        assert_eq!(
            events(&mut rx),
            vec![StreamEvent::Elements {
                sid: sid(),
                from: addr(SOURCE),
                elements: elements(3)
            }]
        );

        g.handle_message(addr(SOURCE), make(sid(), Close)).unwrap();
        assert!(g.is_empty());
        let late = g.handle_message(
            addr(SOURCE),
            make(
                sid(),
                Batch {
                    xs_size: 0,
                    xs: vec![],
                    id: 1,
                },
            ),
        );
        assert!(late.is_err());
        assert!(!g.has_outgoing());
    }

    #[test]
    fn test_sink_aborts_on_sequence_gap() {
        let (mut g, mut rx) = graph(SINK);
        g.handle_message(
            addr(SOURCE),
            make(
                sid(),
                Open {
                    token: vec![],
                    prev_stage: None,
                    priority: StreamPriority::Normal,
                    topics: vec![],
                    redeployable: false,
                },
            ),
        )
        .unwrap();
        g.take_outgoing();
        events(&mut rx);

        let xs = element::pack(sid(), &elements(1)).unwrap();
        let err = g
            .handle_message(addr(SOURCE), make(sid(), Batch { xs_size: 1, xs, id: 1 }))
            .unwrap_err();
        assert!(matches!(err, StreamError::SequenceGap { expected: 0, got: 1, .. }));

        let out = g.take_outgoing();
        assert_eq!(tags(&out), vec![("abort", addr(SOURCE))]);
        assert_eq!(
            out[0].message.get::<Abort>().unwrap().reason.code,
            ErrorCode::InvalidStreamState
        );
        assert_eq!(events(&mut rx)[0].error_kind(), Some(ErrorKind::StreamFatal));
    }

    #[test]
    fn test_relay_forwards_and_propagates_abort() {
        let (mut g, mut rx) = graph(SINK);
        g.handle_message(
            addr(SOURCE),
            make(
                sid(),
                Open {
                    token: vec![],
                    prev_stage: None,
                    priority: StreamPriority::Normal,
                    topics: vec![],
                    redeployable: false,
                },
            ),
        )
        .unwrap();
        g.open_downstream(sid(), addr(NEXT), OpenRequest::new(vec![])).unwrap();
        let out = g.take_outgoing();
        assert_eq!(
            out[1].message.get::<Open>().unwrap().prev_stage,
            Some(addr(SOURCE))
        );

        g.handle_message(
            addr(NEXT),
            make(
                sid(),
                AckOpen {
                    initial_demand: 5,
                    filter: vec![],
                    redeployable: false,
                },
            ),
        )
        .unwrap();
        let xs = element::pack(sid(), &elements(3)).unwrap();
        g.handle_message(addr(SOURCE), make(sid(), Batch { xs_size: 3, xs, id: 0 }))
            .unwrap();
        assert_eq!(
            tags(&g.take_outgoing()),
            vec![("demand", addr(SOURCE)), ("batch", addr(NEXT))]
        );
        events(&mut rx);

        g.handle_message(
            addr(NEXT),
            make(
                sid(),
                Abort {
                    reason: ErrorCode::UnhandledStreamError.into(),
                },
            ),
        )
        .unwrap();
        let out = g.take_outgoing();
        assert_eq!(tags(&out), vec![("abort", addr(SOURCE))]);
        assert_eq!(
            out[0].message.get::<Abort>().unwrap().reason.code,
            ErrorCode::UnhandledStreamError
        );
        assert_eq!(events(&mut rx)[0].error_kind(), Some(ErrorKind::StreamFatal));
        assert!(g.is_empty());
    }

    #[test]
    fn test_upstream_redeploy() {
        let (mut g, mut rx) = graph(SINK);
        let open = make(
            sid(),
            Open {
                token: vec![],
                prev_stage: None,
                priority: StreamPriority::Normal,
                topics: vec![],
                redeployable: true,
            },
        );
        g.handle_message(addr(SOURCE), open.clone()).unwrap();
        g.handle_message(
            addr(SOURCE),
            make(
                sid(),
                UpstreamFailed {
                    reason: ErrorCode::SocketDisconnected.into(),
                },
            ),
        )
        .unwrap();
        assert_eq!(g.path(sid(), addr(SOURCE)).unwrap().state(), PathState::Failed);
        g.take_outgoing();
        events(&mut rx);

        // The source re-sends open on reconnect
        g.handle_message(addr(SOURCE), open.clone()).unwrap();
        assert_eq!(tags(&g.take_outgoing()), vec![("ok", addr(SOURCE))]);
        assert_eq!(g.path(sid(), addr(SOURCE)).unwrap().state(), PathState::Active);
        assert!(g.drain_new_failures().is_empty());
        assert!(matches!(events(&mut rx).as_slice(), [StreamEvent::Resumed { .. }]));

        // A duplicate open on a healthy path is refused
        assert!(g.handle_message(addr(SOURCE), open).is_err());
    }

    #[test]
    fn test_abort_all() {
        let (mut g, mut rx) = active_source(10, false);
        let other = StreamId::new(addr(SOURCE), 8);
        g.open_downstream(other, addr(NEXT), OpenRequest::new(vec![])).unwrap();
        g.take_outgoing();

        g.abort_all(ErrorReason::new(ErrorCode::SocketDisconnected, "transport lost"));
        assert!(g.is_empty());
        assert_eq!(
            tags(&g.take_outgoing()),
            vec![("abort", addr(SINK)), ("abort", addr(NEXT))]
        );
        let evs = events(&mut rx);
        assert_eq!(evs.len(), 2);
        assert!(evs.iter().all(|e| e.error_kind() == Some(ErrorKind::StreamFatal)));
    }
}
