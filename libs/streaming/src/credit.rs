//! # Credit Engine
//!
//! Per-path flow control. The source side ([`OutboundCredit`]) may only send
//! as many elements as the sink granted; the sink side ([`InboundCredit`])
//! checks that promise and produces cumulative acknowledgements.
//!
//! ```text
//!  source                                   sink
//!  ──────                                   ────
//!  credit = initial_demand  ◄── ack_open ── granted = initial_demand
//!  reserve(n): n ≤ credit
//!    credit -= n, id = next++ ── batch ──►  id == expected, n ≤ granted
//!                                           granted -= n
//!  id > highest_acked:      ◄─ ack_batch ── granted += cap
//!    credit += cap                          acknowledged_id = expected - 1
//!  id == highest_acked:
//!    credit += cap - seen
//! ```
//!
//! Batch ids start at 0 and `highest_acked_id` at -1. An ack below the
//! highest id seen so far is stale and changes nothing.
//!
//! A sink may grant credit without any new batch having arrived, so several
//! acks can carry the same `acknowledged_id`. For those, `new_capacity` is
//! the total granted since that id was first acknowledged and the source
//! applies only the increase. Replaying any ack is therefore a no-op.

use crate::error::{Result, StreamError};
use codec::{AckBatch, Batch};
use tracing::warn;
use types::{StreamId, Topic};

/// Result of applying an `ack_batch` on the source side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Credit and acknowledgement state advanced
    Applied { newly_acked: i64, credit: i32 },
    /// `acknowledged_id` below the highest ack seen, or a repeat of it
    /// granting nothing new
    Stale,
    /// `acknowledged_id` names a batch that was never sent
    Unsent,
    /// Negative `new_capacity`
    InvalidCapacity,
}

/// Source-side credit state of one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCredit {
    credit_available: i32,
    next_batch_id: i64,
    highest_acked_id: i64,
    /// Capacity applied so far by acks carrying `highest_acked_id`
    granted_at_highest: i32,
    filter: Vec<Topic>,
}

impl Default for OutboundCredit {
    fn default() -> Self {
        Self {
            credit_available: 0,
            next_batch_id: 0,
            highest_acked_id: -1,
            granted_at_highest: 0,
            filter: Vec::new(),
        }
    }
}

impl OutboundCredit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the sink's `ack_open`: credit is set, not added
    pub fn grant(&mut self, initial_demand: i32, filter: Vec<Topic>) {
        self.credit_available = initial_demand.max(0);
        self.filter = filter;
    }

    pub fn credit_available(&self) -> i32 {
        self.credit_available
    }

    pub fn next_batch_id(&self) -> i64 {
        self.next_batch_id
    }

    pub fn highest_acked_id(&self) -> i64 {
        self.highest_acked_id
    }

    pub fn filter(&self) -> &[Topic] {
        &self.filter
    }

    /// Batches sent but not yet acknowledged
    pub fn in_flight(&self) -> i64 {
        self.next_batch_id - 1 - self.highest_acked_id
    }

    /// Every sent batch has been acknowledged
    pub fn is_drained(&self) -> bool {
        self.in_flight() == 0
    }

    /// Consume credit for a batch of `xs_size` elements and assign its id
    ///
    /// Fails without touching any state if the batch does not fit.
    pub fn reserve(&mut self, sid: StreamId, xs_size: i32) -> Result<i64> {
        if xs_size < 0 || xs_size > self.credit_available {
            return Err(StreamError::CreditViolation {
                sid,
                requested: xs_size,
                available: self.credit_available,
            });
        }
        self.credit_available -= xs_size;
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        Ok(id)
    }

    pub fn apply_ack(&mut self, sid: StreamId, ack: &AckBatch) -> AckOutcome {
        if ack.new_capacity < 0 {
            warn!(%sid, new_capacity = ack.new_capacity, "Ignoring ack_batch with negative capacity");
            return AckOutcome::InvalidCapacity;
        }
        if ack.acknowledged_id >= self.next_batch_id {
            warn!(
                %sid,
                acknowledged_id = ack.acknowledged_id,
                next_batch_id = self.next_batch_id,
                "Ignoring ack_batch for unsent batch"
            );
            return AckOutcome::Unsent;
        }
        if ack.acknowledged_id < self.highest_acked_id {
            warn!(
                %sid,
                acknowledged_id = ack.acknowledged_id,
                highest_acked_id = self.highest_acked_id,
                "Ignoring stale ack_batch"
            );
            return AckOutcome::Stale;
        }

        if ack.acknowledged_id == self.highest_acked_id {
            let added = ack.new_capacity - self.granted_at_highest;
            if added <= 0 {
                warn!(
                    %sid,
                    acknowledged_id = ack.acknowledged_id,
                    new_capacity = ack.new_capacity,
                    "Ignoring repeated ack_batch"
                );
                return AckOutcome::Stale;
            }
            self.granted_at_highest = ack.new_capacity;
            self.credit_available = self.credit_available.saturating_add(added);
            return AckOutcome::Applied {
                newly_acked: 0,
                credit: self.credit_available,
            };
        }

        let newly_acked = ack.acknowledged_id - self.highest_acked_id;
        self.highest_acked_id = ack.acknowledged_id;
        self.granted_at_highest = ack.new_capacity;
        self.credit_available = self.credit_available.saturating_add(ack.new_capacity);
        AckOutcome::Applied {
            newly_acked,
            credit: self.credit_available,
        }
    }
}

/// Sink-side view of one path: what was granted and what arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCredit {
    granted: i32,
    next_expected_id: i64,
    last_acked_id: i64,
    /// Capacity granted by acks carrying `last_acked_id`
    granted_since_ack: i32,
}

impl InboundCredit {
    pub fn new(initial_demand: i32) -> Self {
        Self {
            granted: initial_demand.max(0),
            next_expected_id: 0,
            last_acked_id: -1,
            granted_since_ack: 0,
        }
    }

    /// Credit the source currently holds
    pub fn granted(&self) -> i32 {
        self.granted
    }

    pub fn next_expected_id(&self) -> i64 {
        self.next_expected_id
    }

    /// Check a received batch against sequence and credit
    pub fn accept(&mut self, sid: StreamId, batch: &Batch) -> Result<()> {
        if batch.id != self.next_expected_id {
            return Err(StreamError::SequenceGap {
                sid,
                expected: self.next_expected_id,
                got: batch.id,
            });
        }
        if batch.xs_size < 0 || batch.xs_size > self.granted {
            return Err(StreamError::CreditViolation {
                sid,
                requested: batch.xs_size,
                available: self.granted,
            });
        }
        self.granted -= batch.xs_size;
        self.next_expected_id += 1;
        Ok(())
    }

    /// Grant `new_capacity` more credit, acknowledging everything received
    ///
    /// Repeated grants for the same acknowledged id report the running total.
    pub fn acknowledge(&mut self, new_capacity: i32) -> AckBatch {
        let new_capacity = new_capacity.max(0);
        self.granted = self.granted.saturating_add(new_capacity);
        let acknowledged_id = self.next_expected_id - 1;
        if acknowledged_id == self.last_acked_id {
            self.granted_since_ack = self.granted_since_ack.saturating_add(new_capacity);
        } else {
            self.last_acked_id = acknowledged_id;
            self.granted_since_ack = new_capacity;
        }
        AckBatch {
            new_capacity: self.granted_since_ack,
            acknowledged_id,
        }
    }
}
