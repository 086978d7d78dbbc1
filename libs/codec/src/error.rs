//! Protocol-level errors for stream frame processing
//!
//! Every decode failure maps to [`ErrorKind::MalformedMessage`]: a frame that
//! cannot be decoded is connection-fatal, never silently dropped. Each variant
//! carries enough context (offsets, sizes, offending values) to debug a bad
//! peer from a single log line.

use thiserror::Error;
use types::ErrorKind;

/// Frame encoding/decoding errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer is too small to contain the expected structure
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Frame magic validation failed
    #[error("Invalid magic number: expected {expected:#010x}, got {actual:#010x} (indicates: {diagnosis})")]
    InvalidMagic {
        expected: u32,
        actual: u32,
        diagnosis: String,
    },

    /// Protocol version is not supported by this decoder
    #[error("Unsupported frame version {version}: supported version is {supported}")]
    UnsupportedVersion { version: u8, supported: u8 },

    /// Variant tag outside the closed set of stream message variants
    #[error("Unknown stream message tag {tag}: valid tags are 1-8")]
    UnknownVariant { tag: u8 },

    /// Body checksum validation failed - indicates data corruption
    #[error("Checksum mismatch: expected {expected:#010x}, calculated {calculated:#010x} (payload: {payload_size} bytes)")]
    ChecksumMismatch {
        expected: u32,
        calculated: u32,
        payload_size: usize,
    },

    /// Declared payload exceeds the configured limit
    #[error("Payload too large: {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Buffer length disagrees with the header's declared frame length
    #[error("Frame length mismatch: header declares {declared} bytes, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Frame body could not be decoded as the declared variant
    #[error("Invalid payload for {variant}: {reason}")]
    InvalidPayload { variant: &'static str, reason: String },

    /// Message could not be encoded
    #[error("Encode failed for {variant}: {reason}")]
    Encode { variant: &'static str, reason: String },
}

impl ProtocolError {
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    /// InvalidMagic with a best guess at what went wrong
    pub fn invalid_magic(expected: u32, actual: u32) -> Self {
        let diagnosis = match actual {
            0x0000_0000 => "uninitialized buffer",
            0xFFFF_FFFF => "corrupted buffer",
            _ if actual.swap_bytes() == expected => "byte order (endianness) mismatch",
            _ => "framing lost or foreign protocol",
        };

        Self::InvalidMagic {
            expected,
            actual,
            diagnosis: diagnosis.to_string(),
        }
    }

    pub fn invalid_payload(variant: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            variant,
            reason: reason.into(),
        }
    }

    pub fn encode(variant: &'static str, reason: impl Into<String>) -> Self {
        Self::Encode {
            variant,
            reason: reason.into(),
        }
    }

    /// Position in the shared error taxonomy
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedMessage
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
