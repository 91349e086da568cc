use thiserror::Error;

/// Errors raised while building, framing or decoding protocol messages.
///
/// Every decode-time variant means the byte stream can no longer be trusted,
/// so a connection that hits one is dropped rather than resynchronized.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("unknown payload format {0}")]
    UnknownFormat(u8),
    #[error("unsupported payload format {0:?}")]
    UnsupportedFormat(crate::protocol::PayloadFormat),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("payload is not valid utf-8")]
    InvalidText(#[from] std::str::Utf8Error),
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary payload error: {0}")]
    Binary(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
