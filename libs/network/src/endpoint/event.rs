//! Deferred work items

use std::fmt;
use types::ActorAddr;

/// What a scheduled timeout is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// A failed redeployable path ran out of time to resume
    FailureGrace,
    /// No traffic on the endpoint for a while
    Idle,
}

impl TimeoutKind {
    pub fn name(self) -> &'static str {
        match self {
            TimeoutKind::FailureGrace => "failure_grace",
            TimeoutKind::Idle => "idle",
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work pushed by any thread and drained by the endpoint's write handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredEvent {
    /// A clock timeout fired
    Timeout { kind: TimeoutKind, id: u64 },
    /// Resolve `path` and report the result to `listener`
    ResolveRequest { path: String, listener: ActorAddr },
}

impl DeferredEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeferredEvent::Timeout { .. } => "timeout",
            DeferredEvent::ResolveRequest { .. } => "resolve_request",
        }
    }
}

/// Deficit weight per event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWeights {
    pub timeout: u32,
    pub resolve: u32,
}

impl TaskWeights {
    pub fn task_size(&self, event: &DeferredEvent) -> u32 {
        match event {
            DeferredEvent::Timeout { .. } => self.timeout,
            DeferredEvent::ResolveRequest { .. } => self.resolve,
        }
    }
}

impl Default for TaskWeights {
    fn default() -> Self {
        Self {
            timeout: 1,
            resolve: 1,
        }
    }
}
