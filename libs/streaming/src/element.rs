//! Stream elements and batch payload packing
//!
//! A batch's `xs` is the bincode encoding of `Vec<StreamElement>`; its
//! `xs_size` is the element count, which is what credit is measured in.

use crate::error::{Result, StreamError};
use bincode::Options;
use serde::{Deserialize, Serialize};
use types::{StreamId, Topic};

/// One unit of stream data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamElement {
    /// Channel tag; untagged elements only pass paths without a filter
    pub topic: Option<Topic>,
    pub payload: Vec<u8>,
}

impl StreamElement {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: None,
            payload: payload.into(),
        }
    }

    pub fn tagged(topic: impl Into<Topic>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: Some(topic.into()),
            payload: payload.into(),
        }
    }

    /// Whether a path with `filter` forwards this element
    pub fn passes(&self, filter: &[Topic]) -> bool {
        if filter.is_empty() {
            return true;
        }
        match &self.topic {
            Some(topic) => filter.contains(topic),
            None => false,
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

pub fn pack(sid: StreamId, elements: &[StreamElement]) -> Result<Vec<u8>> {
    options().serialize(elements).map_err(|e| StreamError::Element {
        sid,
        reason: e.to_string(),
    })
}

/// Decode a batch payload, checking it holds exactly `xs_size` elements
pub fn unpack(sid: StreamId, xs: &[u8], xs_size: i32) -> Result<Vec<StreamElement>> {
    let elements: Vec<StreamElement> =
        options().deserialize(xs).map_err(|e| StreamError::Element {
            sid,
            reason: e.to_string(),
        })?;
    if elements.len() as i64 != i64::from(xs_size) {
        return Err(StreamError::Element {
            sid,
            reason: format!(
                "xs_size {} disagrees with {} packed elements",
                xs_size,
                elements.len()
            ),
        });
    }
    Ok(elements)
}
