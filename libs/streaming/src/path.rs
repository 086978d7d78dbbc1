//! # Path State Machine
//!
//! One directed hop of a stream between the local stage and a peer.
//!
//! ```text
//!            open sent        ack_open
//! Pending ─────────────► Open ─────────► Active ──close──► Closing ──drained──► Closed
//!    │                    │               │  ▲                │                   ▲
//!    │                    │         failed│  │resume   resume│  │failed           │
//!    │                    │               ▼  │                │  ▼                 │
//!    │                    └─────────────► Failed ─────────────────────────────────┤
//!    └──────────────────── abort / non-redeployable failure ──────────────────────┘
//! ```
//!
//! A path that fails while `Closing` resumes into `Closing`, so the close
//! still completes once it drains.
//!
//! Transitions outside this graph are rejected with
//! [`StreamError::InvalidTransition`]. Nothing leaves `Closed`.

use crate::credit::{InboundCredit, OutboundCredit};
use crate::element::StreamElement;
use crate::error::{Result, StreamError};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use tracing::debug;
use types::{ActorAddr, ErrorReason, StreamId, StreamPriority, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathState {
    /// Requested locally, nothing exchanged yet
    Pending,
    /// `open` sent (or received), handshake not complete
    Open,
    /// Batches flow
    Active,
    /// Waiting for a resume after a redeployable failure
    Failed,
    /// Draining before sending `close`
    Closing,
    Closed,
}

impl PathState {
    pub fn name(self) -> &'static str {
        match self {
            PathState::Pending => "pending",
            PathState::Open => "open",
            PathState::Active => "active",
            PathState::Failed => "failed",
            PathState::Closing => "closing",
            PathState::Closed => "closed",
        }
    }

    fn can_transition_to(self, to: PathState) -> bool {
        use PathState::*;
        matches!(
            (self, to),
            (Pending, Open)
                | (Pending, Closed)
                | (Open, Active)
                | (Open, Failed)
                | (Open, Closed)
                | (Active, Closing)
                | (Active, Failed)
                | (Active, Closed)
                | (Failed, Active)
                | (Failed, Closing)
                | (Failed, Closed)
                | (Closing, Failed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which way batches flow on a path, seen from the local stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Peer sends batches to us
    Upstream,
    /// We send batches to the peer
    Downstream,
}

/// Credit state matching the path's direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Outbound(OutboundCredit),
    Inbound(InboundCredit),
}

#[derive(Debug, Clone)]
pub struct Path {
    sid: StreamId,
    peer: ActorAddr,
    direction: Direction,
    state: PathState,
    redeployable: bool,
    priority: StreamPriority,
    flow: Flow,
    /// Elements accepted locally but not yet sent
    buffer: VecDeque<StreamElement>,
    failure: Option<(ErrorReason, Instant)>,
    /// State a resume returns to
    resume_to: PathState,
}

impl Path {
    /// Path on which we will send to `peer`, starting `Pending`
    pub fn downstream(
        sid: StreamId,
        peer: ActorAddr,
        priority: StreamPriority,
        redeployable: bool,
    ) -> Self {
        Self {
            sid,
            peer,
            direction: Direction::Downstream,
            state: PathState::Pending,
            redeployable,
            priority,
            flow: Flow::Outbound(OutboundCredit::new()),
            buffer: VecDeque::new(),
            failure: None,
            resume_to: PathState::Active,
        }
    }

    /// Path on which `peer` sends to us, starting `Pending`
    pub fn upstream(
        sid: StreamId,
        peer: ActorAddr,
        priority: StreamPriority,
        redeployable: bool,
        initial_demand: i32,
    ) -> Self {
        Self {
            sid,
            peer,
            direction: Direction::Upstream,
            state: PathState::Pending,
            redeployable,
            priority,
            flow: Flow::Inbound(InboundCredit::new(initial_demand)),
            buffer: VecDeque::new(),
            failure: None,
            resume_to: PathState::Active,
        }
    }

    pub fn sid(&self) -> StreamId {
        self.sid
    }

    pub fn peer(&self) -> ActorAddr {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> PathState {
        self.state
    }

    pub fn redeployable(&self) -> bool {
        self.redeployable
    }

    pub fn priority(&self) -> StreamPriority {
        self.priority
    }

    pub fn outbound(&self) -> Option<&OutboundCredit> {
        match &self.flow {
            Flow::Outbound(credit) => Some(credit),
            Flow::Inbound(_) => None,
        }
    }

    pub fn outbound_mut(&mut self) -> Option<&mut OutboundCredit> {
        match &mut self.flow {
            Flow::Outbound(credit) => Some(credit),
            Flow::Inbound(_) => None,
        }
    }

    pub fn inbound(&self) -> Option<&InboundCredit> {
        match &self.flow {
            Flow::Inbound(credit) => Some(credit),
            Flow::Outbound(_) => None,
        }
    }

    pub fn inbound_mut(&mut self) -> Option<&mut InboundCredit> {
        match &mut self.flow {
            Flow::Inbound(credit) => Some(credit),
            Flow::Outbound(_) => None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reason and time of the failure a `Failed` path waits out
    pub fn failure(&self) -> Option<&(ErrorReason, Instant)> {
        self.failure.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == PathState::Closed
    }

    /// Batches may be sent in this state
    pub fn can_send(&self) -> bool {
        matches!(self.state, PathState::Active | PathState::Closing)
    }

    /// Elements may still be queued for this path
    pub fn accepts_elements(&self) -> bool {
        self.direction == Direction::Downstream
            && matches!(
                self.state,
                PathState::Pending | PathState::Open | PathState::Active | PathState::Failed
            )
    }

    pub fn transition(&mut self, to: PathState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(StreamError::InvalidTransition {
                sid: self.sid,
                from: self.state,
                to,
            });
        }
        debug!(sid = %self.sid, peer = %self.peer, from = %self.state, %to, "Path transition");
        self.state = to;
        Ok(())
    }

    /// Complete the handshake from the source side
    pub fn activate(
        &mut self,
        initial_demand: i32,
        filter: Vec<Topic>,
        redeployable: bool,
    ) -> Result<()> {
        self.transition(PathState::Active)?;
        self.redeployable = redeployable;
        if let Flow::Outbound(credit) = &mut self.flow {
            credit.grant(initial_demand, filter);
            let filter = credit.filter().to_vec();
            self.buffer.retain(|element| element.passes(&filter));
        }
        Ok(())
    }

    /// Queue elements, dropping those the path's filter excludes
    ///
    /// Before the handshake the filter is unknown, so everything is queued
    /// and filtered on activation. Returns how many were queued.
    pub fn enqueue(&mut self, elements: &[StreamElement]) -> usize {
        let filter = self
            .outbound()
            .map(|credit| credit.filter().to_vec())
            .unwrap_or_default();
        let before = self.buffer.len();
        self.buffer
            .extend(elements.iter().filter(|e| e.passes(&filter)).cloned());
        self.buffer.len() - before
    }

    /// Take up to `max` buffered elements that fit the available credit
    pub fn take_sendable(&mut self, max: i32) -> Vec<StreamElement> {
        let credit = match (&self.flow, self.can_send()) {
            (Flow::Outbound(credit), true) => credit.credit_available(),
            _ => return Vec::new(),
        };
        let n = credit.min(max).max(0) as usize;
        let n = n.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }

    /// Nothing buffered and nothing in flight
    pub fn is_drained(&self) -> bool {
        self.buffer.is_empty() && self.outbound().map_or(true, |c| c.is_drained())
    }

    /// Enter `Failed`, keeping buffered elements for a resume
    pub fn fail(&mut self, reason: ErrorReason, at: Instant) -> Result<()> {
        let before = self.state;
        self.transition(PathState::Failed)?;
        self.resume_to = match before {
            PathState::Closing => PathState::Closing,
            _ => PathState::Active,
        };
        self.failure = Some((reason, at));
        Ok(())
    }

    /// Leave `Failed` for `Active`, or for `Closing` if the path was
    /// draining when it failed
    pub fn resume(&mut self) -> Result<()> {
        if self.state != PathState::Failed {
            return Err(StreamError::InvalidTransition {
                sid: self.sid,
                from: self.state,
                to: self.resume_to,
            });
        }
        self.transition(self.resume_to)?;
        self.resume_to = PathState::Active;
        self.failure = None;
        Ok(())
    }

    /// Rebind a failed upstream path after the peer re-sent `open`
    pub fn redeploy(&mut self, initial_demand: i32) -> Result<()> {
        self.resume()?;
        if let Flow::Inbound(credit) = &mut self.flow {
            *credit = InboundCredit::new(initial_demand);
        }
        Ok(())
    }

    /// Move to `Closed` from any state, discarding buffered elements
    pub fn close(&mut self) {
        if self.state != PathState::Closed {
            debug!(sid = %self.sid, peer = %self.peer, from = %self.state, "Path closed");
            self.state = PathState::Closed;
        }
        self.buffer.clear();
    }
}
