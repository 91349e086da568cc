//! Fixed-header binary frames exchanged between clients and the server.
//!
//! Frame layout, all multi-byte fields big-endian:
//!
//! ```text
//! [kind:1][format:1][length:2][payload:length]['\n']
//! ```
//!
//! The trailing delimiter lets stream readers confirm that a frame ended where
//! the header said it would.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error::ProtoError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4;

/// Byte appended after every payload.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Largest payload a frame can carry (16-bit length field).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Message kinds. The discriminants are the wire values and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Auth = 0,
    AuthAck = 1,
    Connect = 2,
    Disconnect = 3,
    LobbyCreate = 4,
    LobbyCreated = 5,
    LobbyDeleted = 6,
    LobbyGameStart = 7,
    LobbyGameStarted = 8,
    LobbyClientsNotReady = 9,
    LobbyClientReady = 10,
    LobbyClientJoin = 11,
    LobbyClientLeave = 12,
    LobbiesSync = 13,
    LobbiesSynced = 14,
    LobbyPromote = 15,
    LobbyPromoted = 16,
    LobbyKick = 17,
    LobbyKicked = 18,
    ClientInput = 19,
    ServerState = 20,
}

impl MessageKind {
    pub const ALL: [MessageKind; 21] = [
        MessageKind::Auth,
        MessageKind::AuthAck,
        MessageKind::Connect,
        MessageKind::Disconnect,
        MessageKind::LobbyCreate,
        MessageKind::LobbyCreated,
        MessageKind::LobbyDeleted,
        MessageKind::LobbyGameStart,
        MessageKind::LobbyGameStarted,
        MessageKind::LobbyClientsNotReady,
        MessageKind::LobbyClientReady,
        MessageKind::LobbyClientJoin,
        MessageKind::LobbyClientLeave,
        MessageKind::LobbiesSync,
        MessageKind::LobbiesSynced,
        MessageKind::LobbyPromote,
        MessageKind::LobbyPromoted,
        MessageKind::LobbyKick,
        MessageKind::LobbyKicked,
        MessageKind::ClientInput,
        MessageKind::ServerState,
    ];
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageKind::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtoError::UnknownKind(value))
    }
}

/// How a payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadFormat {
    Text = 0,
    Json = 1,
    Binary = 2,
}

impl TryFrom<u8> for PayloadFormat {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadFormat::Text),
            1 => Ok(PayloadFormat::Json),
            2 => Ok(PayloadFormat::Binary),
            other => Err(ProtoError::UnknownFormat(other)),
        }
    }
}

/// A single protocol unit. The payload length is always derived from the
/// payload itself, so a constructed message can never disagree with its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    format: PayloadFormat,
    payload: Bytes,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        format: PayloadFormat,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtoError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtoError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            kind,
            format,
            payload,
        })
    }

    /// Message with no payload.
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            format: PayloadFormat::Text,
            payload: Bytes::new(),
        }
    }

    /// Message carrying a UTF-8 text payload.
    pub fn text(kind: MessageKind, text: &str) -> Result<Self, ProtoError> {
        Self::new(
            kind,
            PayloadFormat::Text,
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    /// Message carrying a serialized value. JSON and binary are supported;
    /// asking for text fails with [`ProtoError::UnsupportedFormat`].
    pub fn structured<T: Serialize>(
        kind: MessageKind,
        format: PayloadFormat,
        value: &T,
    ) -> Result<Self, ProtoError> {
        let data = match format {
            PayloadFormat::Json => serde_json::to_vec(value)?,
            PayloadFormat::Binary => bincode::serialize(value)?,
            PayloadFormat::Text => return Err(ProtoError::UnsupportedFormat(format)),
        };
        Self::new(kind, format, data)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn payload_text(&self) -> Result<&str, ProtoError> {
        Ok(std::str::from_utf8(&self.payload)?)
    }

    /// Deserializes the payload according to the message's own format byte.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        match self.format {
            PayloadFormat::Json => Ok(serde_json::from_slice(&self.payload)?),
            PayloadFormat::Binary => Ok(bincode::deserialize(&self.payload)?),
            PayloadFormat::Text => Err(ProtoError::UnsupportedFormat(self.format)),
        }
    }

    /// Number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + 1
    }

    /// Appends the full frame, delimiter included, to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.format as u8);
        dst.put_u16(self.payload_len());
        dst.put_slice(&self.payload);
        dst.put_u8(FRAME_DELIMITER);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{kind: {:?}, format: {:?}, size: {}}}",
            self.kind,
            self.format,
            self.payload.len()
        )
    }
}

/// Encodes a message into a standalone frame.
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.encoded_len());
    message.encode_into(&mut buf);
    buf.freeze()
}

/// Decodes one frame from the start of `buf`. Bytes after the declared
/// payload (the delimiter, or anything else) are ignored.
pub fn decode(buf: &[u8]) -> Result<Message, ProtoError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtoError::MalformedFrame("shorter than header"));
    }
    let kind = MessageKind::try_from(buf[0])?;
    let format = PayloadFormat::try_from(buf[1])?;
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = HEADER_LEN + len;
    if buf.len() < end {
        return Err(ProtoError::MalformedFrame("declared length exceeds buffer"));
    }
    Ok(Message {
        kind,
        format,
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..end]),
    })
}
