//! WebSocket frame data model
//!
//! A [`Frame`] produced by the decoder does not own a copy of its payload:
//! it holds the slices of the read buffers the payload arrived in.

use bytes::{BufMut, Bytes, BytesMut};

use crate::mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble; reserved values yield `None`
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client: masks outbound frames, reads unmasked frames
    Client,
    /// Server: reads masked frames, never masks outbound frames
    Server,
}

impl Role {
    /// Whether frames read by this endpoint must carry a mask
    #[inline]
    pub fn expects_masked_reads(&self) -> bool {
        *self == Role::Server
    }

    /// Whether frames written by this endpoint must be masked
    #[inline]
    pub fn masks_writes(&self) -> bool {
        *self == Role::Client
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1-3 as a 3-bit value; always 0 without negotiated extensions
    pub rsv: u8,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key, present iff `masked`
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        header_size(self.payload_len, self.masked)
    }

    /// Encode the frame header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8 | ((self.rsv & 0x07) << 4);
        if self.fin {
            b0 |= 0x80;
        }
        encode_header(buf, b0, self.payload_len, self.mask);
    }
}

/// Header size for a payload of `payload_len` bytes
#[inline]
pub fn header_size(payload_len: u64, masked: bool) -> usize {
    let mut size = 2;

    if payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
        size += 8;
    } else if payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
        size += 2;
    }

    if masked {
        size += 4;
    }

    size
}

/// Write a header given its first byte, picking the shortest length encoding
#[inline]
pub(crate) fn encode_header(buf: &mut BytesMut, b0: u8, payload_len: u64, mask: Option<[u8; 4]>) {
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len);
    }

    if let Some(mask) = mask {
        buf.put_slice(&mask);
    }
}

/// A complete decoded frame
///
/// `payload` holds the payload slices in wire order. While `is_unmasked()`
/// is false for a masked frame the bytes are still XORed with the key.
#[derive(Debug)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    payload: Vec<BytesMut>,
    unmasked: bool,
}

impl Frame {
    pub(crate) fn from_parts(header: FrameHeader, payload: Vec<BytesMut>) -> Self {
        let unmasked = !header.masked;
        Self {
            header,
            payload,
            unmasked,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Declared payload length
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.header.payload_len
    }

    /// Whether the payload bytes are in the clear
    #[inline]
    pub fn is_unmasked(&self) -> bool {
        self.unmasked
    }

    /// Payload slices in wire order
    #[inline]
    pub fn payload(&self) -> &[BytesMut] {
        &self.payload
    }

    /// Remove the mask from the payload
    ///
    /// Applies the key at most once; later calls and unmasked frames are no-ops.
    pub fn unmask(&mut self) {
        if self.unmasked {
            return;
        }
        if let Some(key) = self.header.mask {
            mask::unmask(key, &mut self.payload);
        }
        self.unmasked = true;
    }

    /// Take the payload slices out of the frame, frozen for sharing
    pub(crate) fn into_payload(self) -> Vec<Bytes> {
        self.payload.into_iter().map(BytesMut::freeze).collect()
    }

    /// Take the payload slices out of the frame without freezing them
    pub(crate) fn into_buffers(self) -> Vec<BytesMut> {
        self.payload
    }

    /// Copy the payload into one contiguous buffer (control frames only need this)
    pub(crate) fn contiguous_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.payload_len.min(MAX_CONTROL_PAYLOAD as u64) as usize);
        for buf in &self.payload {
            out.extend_from_slice(buf);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
    }

    #[test]
    fn test_reserved_opcodes() {
        for op in (0x3..=0x7).chain(0xB..=0xF) {
            assert_eq!(OpCode::from_u8(op), None);
        }
        assert_eq!(OpCode::from_u8(0xA), Some(OpCode::Pong));
    }

    #[test]
    fn test_header_size() {
        assert_eq!(header_size(0, false), 2);
        assert_eq!(header_size(125, true), 6);
        assert_eq!(header_size(126, false), 4);
        assert_eq!(header_size(65535, false), 4);
        assert_eq!(header_size(65536, true), 14);
    }

    #[test]
    fn test_header_encode() {
        let header = FrameHeader {
            fin: true,
            rsv: 0,
            opcode: OpCode::Binary,
            masked: false,
            payload_len: 300,
            mask: None,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[0x82, 126, 0x01, 0x2C]);
        assert_eq!(buf.len(), header.header_size());
    }

    #[test]
    fn test_unmask_once() {
        let key = [1, 2, 3, 4];
        let mut payload = BytesMut::from(&b"abcd"[..]);
        mask::apply_mask(&mut payload, key);

        let header = FrameHeader {
            fin: true,
            rsv: 0,
            opcode: OpCode::Text,
            masked: true,
            payload_len: 4,
            mask: Some(key),
        };
        let mut frame = Frame::from_parts(header, vec![payload]);
        assert!(!frame.is_unmasked());
        frame.unmask();
        frame.unmask();
        assert_eq!(frame.contiguous_payload(), b"abcd");
    }
}
