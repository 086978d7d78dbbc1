//! # Actor Clock
//!
//! Shared timeout scheduler. A fired timeout is never delivered by calling
//! into a manager: it is pushed as a [`DeferredEvent::Timeout`] through the
//! manager's [`EndpointHandle`] and processed by the next write callback,
//! so it cannot preempt a callback in progress.
//!
//! - [`TokioClock`]: one sleeping task per timeout on a tokio runtime
//! - [`ManualClock`]: deterministic, advanced explicitly by tests
//!
//! [`DeferredEvent::Timeout`]: crate::DeferredEvent::Timeout

use crate::endpoint::{EndpointHandle, TimeoutKind};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::trace;

/// Thread-safe timeout scheduling capability
pub trait ActorClock: Send + Sync {
    fn now(&self) -> Instant;

    /// Deliver `(kind, id)` to `recipient` once `at` has passed
    fn set_multi_timeout(&self, at: Instant, recipient: EndpointHandle, kind: TimeoutKind, id: u64);
}

/// Clock backed by tokio timers
#[derive(Debug, Clone)]
pub struct TokioClock {
    runtime: Handle,
}

impl TokioClock {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Clock on the runtime of the calling task, if there is one
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl ActorClock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn set_multi_timeout(&self, at: Instant, recipient: EndpointHandle, kind: TimeoutKind, id: u64) {
        trace!(handle = %recipient.socket(), %kind, id, "Scheduling timeout");
        self.runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
            recipient.deliver_timeout(kind, id);
        });
    }
}

struct Scheduled {
    at: Instant,
    recipient: EndpointHandle,
    kind: TimeoutKind,
    id: u64,
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<Instant>,
    scheduled: Mutex<Vec<Scheduled>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.scheduled.lock().len()
    }

    pub fn advance(&self, by: Duration) -> usize {
        let target = *self.now.lock() + by;
        self.advance_to(target)
    }

    /// Move time forward to `at` and deliver every timeout due by then, in
    /// deadline order; returns how many fired
    pub fn advance_to(&self, at: Instant) -> usize {
        {
            let mut now = self.now.lock();
            if at > *now {
                *now = at;
            }
        }

        let mut due: Vec<Scheduled> = {
            let mut scheduled = self.scheduled.lock();
            let (due, keep): (Vec<_>, Vec<_>) = scheduled.drain(..).partition(|s| s.at <= at);
            *scheduled = keep;
            due
        };
        due.sort_by_key(|s| (s.at, s.id));

        for s in &due {
            s.recipient.deliver_timeout(s.kind, s.id);
        }
        due.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorClock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn set_multi_timeout(&self, at: Instant, recipient: EndpointHandle, kind: TimeoutKind, id: u64) {
        self.scheduled.lock().push(Scheduled {
            at,
            recipient,
            kind,
            id,
        });
    }
}
