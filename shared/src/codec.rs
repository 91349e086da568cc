//! Stream framing for [`Message`] on top of `tokio_util::codec`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;
use crate::protocol::{Message, MessageKind, PayloadFormat, FRAME_DELIMITER, HEADER_LEN};

/// Splits a byte stream into frames and writes frames back out.
///
/// Decoding waits until the header, the full payload and the delimiter are
/// buffered. A delimiter byte other than `'\n'` means the peer and this end
/// disagree on frame boundaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtoError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the header as soon as it is available instead of waiting
        // for a payload that may never arrive.
        let kind = MessageKind::try_from(src[0])?;
        let format = PayloadFormat::try_from(src[1])?;
        let len = u16::from_be_bytes([src[2], src[3]]) as usize;

        let frame_len = HEADER_LEN + len + 1;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        if src[frame_len - 1] != FRAME_DELIMITER {
            return Err(ProtoError::MalformedFrame("missing frame delimiter"));
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        src.advance(1);

        Message::new(kind, format, payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtoError> {
        item.encode_into(dst);
        Ok(())
    }
}
