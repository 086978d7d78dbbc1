//! # Frame Constants
//!
//! Values that define the wire frame and must stay stable across releases.
//!
//! ```text
//! 0        4   5   6       8            12           16
//! ┌────────┬───┬───┬───────┬────────────┬────────────┬──────────────┐
//! │ magic  │ver│tag│ rsvd  │ payload_len│   crc32    │ bincode body │
//! └────────┴───┴───┴───────┴────────────┴────────────┴──────────────┘
//! ```
//!
//! All header integers are big-endian. The body is `(StreamId, Variant)`
//! encoded with fixed-width bincode; the checksum covers the body only.

/// "STRM"
pub const FRAME_MAGIC: u32 = 0x5354_524D;

pub const FRAME_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 16;

/// Default upper bound on a single frame body
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

pub(crate) const MAGIC_OFFSET: usize = 0;
pub(crate) const VERSION_OFFSET: usize = 4;
pub(crate) const TAG_OFFSET: usize = 5;
pub(crate) const LENGTH_OFFSET: usize = 8;
pub(crate) const CHECKSUM_OFFSET: usize = 12;
