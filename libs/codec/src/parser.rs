//! # Frame Parser - Stream Message Decoding
//!
//! Validates the header (magic, version, tag, declared length, checksum)
//! before touching the body, then decodes the body as exactly the variant
//! the tag names. Unknown tags, short buffers, checksum mismatches and
//! trailing bytes are all hard errors.
//!
//! [`frame_length`] lets byte-stream transports split a read buffer into
//! frames without decoding them.

use crate::builder::body_options;
use crate::constants::{
    CHECKSUM_OFFSET, FRAME_MAGIC, FRAME_VERSION, HEADER_SIZE, LENGTH_OFFSET, MAGIC_OFFSET,
    MAX_PAYLOAD_SIZE, TAG_OFFSET, VERSION_OFFSET,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{
    Abort, AckBatch, AckOpen, Batch, Close, Content, DownstreamFailed, Open, StreamMessage,
    UpstreamFailed, VariantTag,
};
use bincode::Options;
use serde::de::DeserializeOwned;
use types::StreamId;

/// Validated view of a frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: VariantTag,
    pub payload_len: usize,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Check magic and version, return the declared payload length
fn validate_prefix(data: &[u8], limit: usize) -> ProtocolResult<usize> {
    let magic = read_u32(data, MAGIC_OFFSET);
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::invalid_magic(FRAME_MAGIC, magic));
    }

    let version = data[VERSION_OFFSET];
    if version != FRAME_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            version,
            supported: FRAME_VERSION,
        });
    }

    let payload_len = read_u32(data, LENGTH_OFFSET) as usize;
    if payload_len > limit {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_len,
            limit,
        });
    }

    Ok(payload_len)
}

/// Parse and validate the fixed header at the start of `data`
pub fn parse_header(data: &[u8]) -> ProtocolResult<FrameHeader> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::message_too_small(
            HEADER_SIZE,
            data.len(),
            "frame header",
        ));
    }

    let payload_len = validate_prefix(data, MAX_PAYLOAD_SIZE)?;
    let raw_tag = data[TAG_OFFSET];
    let tag = VariantTag::try_from(raw_tag).map_err(|_| ProtocolError::UnknownVariant { tag: raw_tag })?;

    Ok(FrameHeader {
        tag,
        payload_len,
        checksum: read_u32(data, CHECKSUM_OFFSET),
    })
}

/// Length of the first complete frame in `buf`
///
/// Returns `Ok(None)` while the header or body is still incomplete. Garbage
/// at the front of the buffer fails as soon as the header is available so a
/// transport does not wait for bytes that will never form a frame.
pub fn frame_length(buf: &[u8], limit: usize) -> ProtocolResult<Option<usize>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let payload_len = validate_prefix(buf, limit)?;
    let total = HEADER_SIZE + payload_len;
    if buf.len() < total {
        Ok(None)
    } else {
        Ok(Some(total))
    }
}

fn decode_body<T: DeserializeOwned>(tag: VariantTag, body: &[u8]) -> ProtocolResult<(StreamId, T)> {
    body_options()
        .deserialize::<(StreamId, T)>(body)
        .map_err(|e| ProtocolError::invalid_payload(tag.name(), e.to_string()))
}

fn decode_content(tag: VariantTag, body: &[u8]) -> ProtocolResult<(StreamId, Content)> {
    let parts: (StreamId, Content) = match tag {
        VariantTag::Open => decode_body::<Open>(tag, body).map(|(s, x)| (s, x.into()))?,
        VariantTag::AckOpen => decode_body::<AckOpen>(tag, body).map(|(s, x)| (s, x.into()))?,
        VariantTag::Batch => decode_body::<Batch>(tag, body).map(|(s, x)| (s, x.into()))?,
        VariantTag::AckBatch => decode_body::<AckBatch>(tag, body).map(|(s, x)| (s, x.into()))?,
        VariantTag::Close => decode_body::<Close>(tag, body).map(|(s, x)| (s, x.into()))?,
        VariantTag::Abort => decode_body::<Abort>(tag, body).map(|(s, x)| (s, x.into()))?,
        VariantTag::DownstreamFailed => {
            decode_body::<DownstreamFailed>(tag, body).map(|(s, x)| (s, x.into()))?
        }
        VariantTag::UpstreamFailed => {
            decode_body::<UpstreamFailed>(tag, body).map(|(s, x)| (s, x.into()))?
        }
    };
    Ok(parts)
}

/// Decode exactly one frame
///
/// `data` must hold the whole frame and nothing else.
pub fn decode(data: &[u8]) -> ProtocolResult<StreamMessage> {
    let header = parse_header(data)?;

    if data.len() != header.frame_len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.frame_len(),
            actual: data.len(),
        });
    }

    let body = &data[HEADER_SIZE..];
    let calculated = crc32fast::hash(body);
    if calculated != header.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected: header.checksum,
            calculated,
            payload_size: body.len(),
        });
    }

    let (sid, content) = decode_content(header.tag, body)?;
    Ok(StreamMessage::from_parts(sid, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::encode;
    use crate::message::make;
    use types::ActorAddr;

    fn close_frame() -> Vec<u8> {
        let sid = StreamId::new(ActorAddr::from_u128(5), 1);
        encode(&make(sid, Close)).unwrap().to_vec()
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut frame = close_frame();
        frame[TAG_OFFSET] = 42;

        assert_eq!(decode(&frame).unwrap_err(), ProtocolError::UnknownVariant { tag: 42 });
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = close_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        assert!(matches!(decode(&frame), Err(ProtocolError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = close_frame();
        assert!(matches!(
            decode(&frame[..HEADER_SIZE - 1]),
            Err(ProtocolError::MessageTooSmall { .. })
        ));
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_length_incremental() {
        let frame = close_frame();

        assert_eq!(frame_length(&frame[..3], MAX_PAYLOAD_SIZE).unwrap(), None);
        assert_eq!(frame_length(&frame[..HEADER_SIZE], MAX_PAYLOAD_SIZE).unwrap(), None);
        assert_eq!(frame_length(&frame, MAX_PAYLOAD_SIZE).unwrap(), Some(frame.len()));

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        assert_eq!(frame_length(&two, MAX_PAYLOAD_SIZE).unwrap(), Some(frame.len()));
    }

    #[test]
    fn test_frame_length_rejects_garbage() {
        let garbage = vec![0u8; HEADER_SIZE];
        assert!(matches!(
            frame_length(&garbage, MAX_PAYLOAD_SIZE),
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_frame_length_enforces_limit() {
        let frame = close_frame();
        assert!(matches!(
            frame_length(&frame, 1),
            Err(ProtocolError::PayloadTooLarge { limit: 1, .. })
        ));
    }
}
