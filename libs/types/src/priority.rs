//! Stream priorities and topic tags

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority for the elements of one stream
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, Serialize, Deserialize,
)]
pub enum StreamPriority {
    VeryHigh = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    VeryLow = 4,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl StreamPriority {
    pub fn name(self) -> &'static str {
        match self {
            StreamPriority::VeryHigh => "very_high",
            StreamPriority::High => "high",
            StreamPriority::Normal => "normal",
            StreamPriority::Low => "low",
            StreamPriority::VeryLow => "very_low",
        }
    }
}

impl fmt::Display for StreamPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Short label naming one channel of a multi-channel stream
///
/// An `open` lists the topics a source offers; an `ack_open` filter lists the
/// subset a sink wants. Empty lists mean "single channel" and "everything".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
