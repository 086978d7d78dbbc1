//! Readiness registration
//!
//! The loop that polls sockets and calls `handle_read_event` /
//! `handle_write_event` lives outside this crate. Endpoints only need one
//! thing from it: a way to ask for a write callback after new work shows up
//! while nobody was draining.

use crate::SocketHandle;
use parking_lot::Mutex;

/// Capability of the external readiness loop
pub trait Multiplexer: Send + Sync {
    /// Request a `handle_write_event` call for `handle`
    fn register_writing(&self, handle: SocketHandle);
}

/// Minimal multiplexer that records write interest until polled
///
/// Registrations are deduplicated; [`ReadinessSet::take_ready`] hands back
/// the handles in registration order and clears the set.
#[derive(Debug, Default)]
pub struct ReadinessSet {
    ready: Mutex<Vec<SocketHandle>>,
}

impl ReadinessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_ready(&self) -> Vec<SocketHandle> {
        std::mem::take(&mut *self.ready.lock())
    }

    pub fn is_registered(&self, handle: SocketHandle) -> bool {
        self.ready.lock().contains(&handle)
    }
}

impl Multiplexer for ReadinessSet {
    fn register_writing(&self, handle: SocketHandle) {
        let mut ready = self.ready.lock();
        if !ready.contains(&handle) {
            ready.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registrations_are_deduplicated() {
        let set = ReadinessSet::new();
        set.register_writing(SocketHandle(2));
        set.register_writing(SocketHandle(1));
        set.register_writing(SocketHandle(2));

        assert!(set.is_registered(SocketHandle(1)));
        assert_eq!(set.take_ready(), vec![SocketHandle(2), SocketHandle(1)]);
        assert!(set.take_ready().is_empty());
    }
}
