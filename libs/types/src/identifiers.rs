//! Actor and stream identifiers
//!
//! [`ActorAddr`] is the only way the streaming core refers to an actor. The
//! core never dereferences it: addresses are compared, hashed, forwarded and
//! serialized, nothing more.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, location-transparent actor address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorAddr {
    id: Uuid,
}

impl ActorAddr {
    /// Allocate a fresh, random address
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self { id }
    }

    /// Deterministic address, handy for fixtures and logs
    pub fn from_u128(value: u128) -> Self {
        Self {
            id: Uuid::from_u128(value),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl Default for ActorAddr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.id.simple())
    }
}

/// Names one logical stream instance
///
/// A stream id is minted by the actor that initiates the stream: `origin` is
/// that actor and `nr` a counter local to it. Equality and ordering follow
/// `(origin, nr)`. Ids are immutable once created; every message and path
/// only references them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    origin: ActorAddr,
    nr: u64,
}

impl StreamId {
    pub fn new(origin: ActorAddr, nr: u64) -> Self {
        Self { origin, nr }
    }

    /// Actor that initiated the stream
    pub fn origin(&self) -> ActorAddr {
        self.origin
    }

    /// Origin-local sequence number
    pub fn nr(&self) -> u64 {
        self.nr
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_actor_addr_identity() {
        let a = ActorAddr::from_u128(7);
        let b = ActorAddr::from_u128(7);
        let c = ActorAddr::new();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string().starts_with("actor-"));
    }

    #[test]
    fn test_stream_id_ordering_and_hashing() {
        let origin = ActorAddr::from_u128(1);
        let first = StreamId::new(origin, 1);
        let second = StreamId::new(origin, 2);

        assert!(first < second);
        assert_eq!(first.origin(), origin);
        assert_eq!(second.nr(), 2);

        let set: HashSet<StreamId> = [first, second, StreamId::new(origin, 1)].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_stream_id_serde() {
        let sid = StreamId::new(ActorAddr::from_u128(0xdead_beef), 42);
        let bytes = bincode::serialize(&sid).unwrap();
        let decoded: StreamId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, sid);
    }
}
