//! # Deferred Event Queue
//!
//! Multi-producer, single-consumer queue of [`DeferredEvent`]s with a
//! "blocked reader" flag, plus the deficit round-robin cache the consumer
//! drains from.
//!
//! ## Protocol
//!
//! ```text
//! producer                         consumer (write handler)
//! ────────                         ───────────────────────
//! push ─► blocked? ─yes─► unblock, return UnblockedReader
//!                  └no──► Success                 │
//!                                                 ▼
//!                              loop { fetch_more; inc_deficit(total);
//!                                     drain while deficit allows }
//!                              until try_block()
//! ```
//!
//! `try_block` only succeeds while no item is pending, under the same lock
//! `push` takes. A producer that slips in between "drained" and "blocked"
//! therefore either sees the reader still active (and its item gets drained
//! by the next loop iteration) or sees it blocked (and wakes it).

use super::event::{DeferredEvent, TaskWeights};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

/// Outcome of [`EventQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Enqueued; the reader is already active
    Success,
    /// Enqueued into a blocked queue; the reader must be woken
    UnblockedReader,
    /// The queue was closed; the event was dropped
    QueueClosed,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<DeferredEvent>,
    blocked: bool,
    closed: bool,
}

/// Concurrent producer side of the deferred-event queue
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    weights: TaskWeights,
}

impl EventQueue {
    /// Create an empty queue; the reader starts blocked
    pub fn new(weights: TaskWeights) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                blocked: true,
                closed: false,
            }),
            weights,
        }
    }

    pub fn weights(&self) -> TaskWeights {
        self.weights
    }

    pub fn push(&self, event: DeferredEvent) -> PushResult {
        let mut state = self.state.lock();
        if state.closed {
            return PushResult::QueueClosed;
        }
        state.pending.push_back(event);
        if state.blocked {
            state.blocked = false;
            PushResult::UnblockedReader
        } else {
            PushResult::Success
        }
    }

    /// Move every pending event into `drr`, returning whether any moved
    pub fn fetch_more(&self, drr: &mut DrrQueue) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return false;
        }
        for event in state.pending.drain(..) {
            drr.push_back(self.weights.task_size(&event), event);
        }
        true
    }

    /// Mark the reader blocked, failing if new events arrived
    pub fn try_block(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.blocked = true;
            true
        } else {
            false
        }
    }

    pub fn blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Refuse further events and drop pending ones, returning how many were dropped
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        state.blocked = true;
        let dropped = state.pending.len();
        state.pending.clear();
        trace!(dropped, "Event queue closed");
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Consumer-side cache drained under a deficit budget
///
/// [`DrrQueue::next`] only yields the front item when its task size fits in
/// the accumulated deficit, and charges the deficit for it. An emptied queue
/// forfeits any leftover deficit.
#[derive(Debug, Default)]
pub struct DrrQueue {
    items: VecDeque<(u32, DeferredEvent)>,
    deficit: u64,
}

impl DrrQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task_size: u32, event: DeferredEvent) {
        self.items.push_back((task_size, event));
    }

    /// Sum of the task sizes of all cached items
    pub fn total_task_size(&self) -> u64 {
        self.items.iter().map(|(size, _)| u64::from(*size)).sum()
    }

    pub fn inc_deficit(&mut self, amount: u64) {
        if !self.items.is_empty() {
            self.deficit += amount;
        }
    }

    pub fn deficit(&self) -> u64 {
        self.deficit
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pop the front item if the deficit covers it
    pub fn next(&mut self) -> Option<DeferredEvent> {
        let (size, _) = self.items.front()?;
        let size = u64::from(*size);
        if size > self.deficit {
            return None;
        }
        self.deficit -= size;
        let (_, event) = self.items.pop_front()?;
        if self.items.is_empty() {
            self.deficit = 0;
        }
        Some(event)
    }
}
