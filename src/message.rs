//! Logical messages produced by the assembler
//!
//! A message's payload is the ordered list of buffer slices the frames
//! arrived in. Nothing is copied unless [`Payload::to_bytes`] is called.

use bytes::{Bytes, BytesMut};

use crate::close::CloseInfo;
use crate::frame::OpCode;

/// Kind of a data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// UTF-8 text
    Text,
    /// Binary data
    Binary,
}

impl DataKind {
    /// Data kind of an opening data frame opcode
    #[inline]
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Text => Some(DataKind::Text),
            OpCode::Binary => Some(DataKind::Binary),
            _ => None,
        }
    }
}

/// Kind of a control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Close
    Close,
}

/// Payload spread over one or more buffer slices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    chunks: Vec<Bytes>,
    len: usize,
}

impl Payload {
    /// Build a payload from chunks, computing the total length once
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(Bytes::len).sum();
        Self { chunks, len }
    }

    /// Total byte count
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload holds no bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload slices in order
    #[inline]
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Consume into the payload slices
    #[inline]
    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }

    /// Contiguous copy of the payload
    ///
    /// Zero-copy when the payload is a single slice.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [one] => one.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.len);
                for chunk in many {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Decode the payload as UTF-8
    ///
    /// Returns `None` if the bytes are not valid UTF-8.
    pub fn as_text(&self) -> Option<String> {
        let bytes = self.to_bytes();
        simdutf8::basic::from_utf8(&bytes).ok().map(str::to_owned)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::from_chunks(vec![b])
    }
}

impl From<&'static str> for Payload {
    fn from(s: &'static str) -> Self {
        Self::from(Bytes::from_static(s.as_bytes()))
    }
}

/// Fully assembled WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 validation is left to the consumer)
    Text(Payload),
    /// Binary message
    Binary(Payload),
    /// Ping message
    Ping(Payload),
    /// Pong message
    Pong(Payload),
    /// Close message; `None` when the peer sent no status code
    Close(Option<CloseInfo>),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Payload::from(Bytes::from(s.into())))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(Payload::from(data.into()))
    }

    /// Create a ping message
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Message::Ping(Payload::from(data.into()))
    }

    /// Create a pong message
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Message::Pong(Payload::from(data.into()))
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        self.control_kind().is_some()
    }

    /// Control kind, if this is a control message
    pub fn control_kind(&self) -> Option<ControlKind> {
        match self {
            Message::Ping(_) => Some(ControlKind::Ping),
            Message::Pong(_) => Some(ControlKind::Pong),
            Message::Close(_) => Some(ControlKind::Close),
            _ => None,
        }
    }

    /// Payload of a text, binary, ping or pong message
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Message::Text(p) | Message::Binary(p) | Message::Ping(p) | Message::Pong(p) => Some(p),
            Message::Close(_) => None,
        }
    }

    /// Payload length in bytes (0 for close)
    #[inline]
    pub fn len(&self) -> usize {
        self.payload().map_or(0, Payload::len)
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One fragment of a data message delivered before the message is complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Kind of the message the fragment belongs to
    pub kind: DataKind,
    /// Payload of this fragment
    pub payload: Payload,
    /// Whether this fragment ends the message
    pub is_last: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_to_bytes() {
        let payload = Payload::from_chunks(vec![
            Bytes::from_static(b"Hel"),
            Bytes::from_static(b"lo"),
        ]);
        assert_eq!(payload.len(), 5);
        assert_eq!(payload.to_bytes(), Bytes::from_static(b"Hello"));
        assert_eq!(payload.as_text().as_deref(), Some("Hello"));
    }

    #[test]
    fn test_payload_single_chunk() {
        let payload = Payload::from(Bytes::from_static(b"abc"));
        assert_eq!(payload.chunks().len(), 1);
        assert_eq!(payload.to_bytes(), Bytes::from_static(b"abc"));
        assert!(Payload::default().is_empty());
    }

    #[test]
    fn test_invalid_text() {
        let payload = Payload::from(Bytes::from_static(&[0xC3, 0x28]));
        assert_eq!(payload.as_text(), None);
    }

    #[test]
    fn test_message_kinds() {
        assert!(Message::ping("x").is_control());
        assert!(!Message::text("x").is_control());
        assert!(Message::Close(None).is_close());
        assert_eq!(Message::binary(vec![1u8, 2, 3]).len(), 3);
        assert_eq!(DataKind::from_opcode(OpCode::Close), None);
    }
}
