//! # Frame Builder - Stream Message Encoding
//!
//! Turns a [`StreamMessage`] into one self-delimiting frame. The encoder never
//! retains the message: callers hand it over, get bytes back, and the message
//! is dropped.

use crate::constants::{FRAME_MAGIC, FRAME_VERSION, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Content, StreamMessage};
use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::trace;
use types::StreamId;

/// Bincode settings shared by encoder and decoder
pub(crate) fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn encode_body<T: Serialize>(
    variant: &'static str,
    sid: &StreamId,
    inner: &T,
) -> ProtocolResult<Vec<u8>> {
    body_options()
        .serialize(&(sid, inner))
        .map_err(|e| ProtocolError::encode(variant, e.to_string()))
}

/// Encode `msg` into a freshly allocated frame
pub fn encode(msg: &StreamMessage) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::new();
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the frame for `msg` to `buf`
pub fn encode_into(msg: &StreamMessage, buf: &mut BytesMut) -> ProtocolResult<()> {
    let tag = msg.tag();
    let sid = msg.sid();
    let body = match msg.content() {
        Content::Open(x) => encode_body(tag.name(), &sid, x)?,
        Content::AckOpen(x) => encode_body(tag.name(), &sid, x)?,
        Content::Batch(x) => encode_body(tag.name(), &sid, x)?,
        Content::AckBatch(x) => encode_body(tag.name(), &sid, x)?,
        Content::Close(x) => encode_body(tag.name(), &sid, x)?,
        Content::Abort(x) => encode_body(tag.name(), &sid, x)?,
        Content::DownstreamFailed(x) => encode_body(tag.name(), &sid, x)?,
        Content::UpstreamFailed(x) => encode_body(tag.name(), &sid, x)?,
    };

    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: body.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }

    buf.reserve(HEADER_SIZE + body.len());
    buf.put_u32(FRAME_MAGIC);
    buf.put_u8(FRAME_VERSION);
    buf.put_u8(tag as u8);
    buf.put_u16(0);
    buf.put_u32(body.len() as u32);
    buf.put_u32(crc32fast::hash(&body));
    buf.put_slice(&body);

    trace!(sid = %sid, variant = tag.name(), bytes = HEADER_SIZE + body.len(), "Encoded stream frame");
    Ok(())
}

/// Function-pointer form of [`encode`], the application-level serializer
/// exposed through endpoint managers
pub type SerializeFn = fn(&StreamMessage) -> ProtocolResult<Bytes>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{make, Close};
    use types::ActorAddr;

    #[test]
    fn test_header_layout() {
        let sid = StreamId::new(ActorAddr::from_u128(3), 9);
        let frame = encode(&make(sid, Close)).unwrap();

        assert_eq!(&frame[0..4], &FRAME_MAGIC.to_be_bytes());
        assert_eq!(frame[4], FRAME_VERSION);
        assert_eq!(frame[5], 5);
        assert_eq!(&frame[6..8], &[0, 0]);

        let payload_len = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
        assert_eq!(frame.len(), HEADER_SIZE + payload_len);

        let checksum = u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]);
        assert_eq!(checksum, crc32fast::hash(&frame[HEADER_SIZE..]));
    }

    #[test]
    fn test_encode_into_appends() {
        let sid = StreamId::new(ActorAddr::from_u128(3), 9);
        let mut buf = BytesMut::new();
        encode_into(&make(sid, Close), &mut buf).unwrap();
        let first = buf.len();
        encode_into(&make(sid, Close), &mut buf).unwrap();
        assert_eq!(buf.len(), first * 2);
    }
}
