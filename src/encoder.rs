//! Outbound frame formatting
//!
//! [`FrameEncoder`] writes a header into an allocator buffer and keeps the
//! caller's payload buffers alongside it, so a frame goes out as one
//! vectored write without copying the payload. Client frames are masked in
//! place with a fresh key per frame.

use std::io::IoSlice;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::trace;

use crate::alloc::BufferAllocator;
use crate::error::{Error, Result};
use crate::frame::{encode_header, header_size};
use crate::mask;
use crate::message::DataKind;
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE};

/// Position of a data frame within its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    /// Unfragmented message
    Whole,
    /// First fragment
    First,
    /// Middle fragment
    Continuation,
    /// Final fragment
    Last,
}

/// Outbound frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundOpcode {
    /// Text data frame
    Text(FrameRole),
    /// Binary data frame
    Binary(FrameRole),
    /// Close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
}

impl OutboundOpcode {
    /// Data opcode for `kind` at position `role`
    #[inline]
    pub fn data(kind: DataKind, role: FrameRole) -> Self {
        match kind {
            DataKind::Text => OutboundOpcode::Text(role),
            DataKind::Binary => OutboundOpcode::Binary(role),
        }
    }

    /// First header byte: FIN bit and opcode
    #[inline]
    pub fn control_byte(&self) -> u8 {
        match self {
            OutboundOpcode::Text(role) => data_byte(0x1, *role),
            OutboundOpcode::Binary(role) => data_byte(0x2, *role),
            OutboundOpcode::Close => 0x88,
            OutboundOpcode::Ping => 0x89,
            OutboundOpcode::Pong => 0x8A,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            OutboundOpcode::Close | OutboundOpcode::Ping | OutboundOpcode::Pong
        )
    }
}

#[inline]
fn data_byte(opcode: u8, role: FrameRole) -> u8 {
    match role {
        FrameRole::Whole => 0x80 | opcode,
        FrameRole::First => opcode,
        FrameRole::Continuation => 0x00,
        FrameRole::Last => 0x80,
    }
}

/// Formats one outbound frame at a time
pub struct FrameEncoder {
    allocator: Arc<dyn BufferAllocator>,
    header: Option<BytesMut>,
    payload: Vec<BytesMut>,
}

impl FrameEncoder {
    /// Create an encoder drawing header buffers from `allocator`
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            allocator,
            header: None,
            payload: Vec::new(),
        }
    }

    /// Format a frame around `payload`
    ///
    /// With `should_mask` the payload is XORed in place with a new random
    /// key. The frame stays held until [`FrameEncoder::cleanup`].
    pub fn format(
        &mut self,
        payload: Vec<BytesMut>,
        opcode: OutboundOpcode,
        should_mask: bool,
    ) -> Result<()> {
        if self.header.is_some() {
            self.release_all(payload);
            return Err(Error::InvalidState(
                "previous frame was not cleaned up before formatting another",
            ));
        }

        let payload_len: usize = payload.iter().map(BytesMut::len).sum();
        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
            self.release_all(payload);
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }

        let mask = should_mask.then(mask::generate_mask);
        let mut header = self.allocator.allocate(MAX_FRAME_HEADER_SIZE);
        encode_header(
            &mut header,
            opcode.control_byte(),
            payload_len as u64,
            mask,
        );
        debug_assert_eq!(header.len(), header_size(payload_len as u64, should_mask));

        self.payload = payload;
        if let Some(key) = mask {
            mask::unmask(key, &mut self.payload);
        }

        trace!(?opcode, payload_len, masked = should_mask, "frame formatted");
        self.header = Some(header);
        Ok(())
    }

    /// Whether a formatted frame is held
    #[inline]
    pub fn is_formatted(&self) -> bool {
        self.header.is_some()
    }

    /// Header bytes of the formatted frame
    #[inline]
    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    /// Total bytes the formatted frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        self.header.as_ref().map_or(0, BytesMut::len)
            + self.payload.iter().map(BytesMut::len).sum::<usize>()
    }

    /// Header followed by the payload buffers, in write order
    pub fn wire_buffers(&self) -> Vec<&[u8]> {
        let Some(header) = self.header.as_deref() else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(header);
        out.extend(self.payload.iter().map(|b| &b[..]).filter(|b| !b.is_empty()));
        out
    }

    /// Wire buffers as slices for vectored I/O
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.wire_buffers().into_iter().map(IoSlice::new).collect()
    }

    /// Release the header and hand the payload buffers back
    ///
    /// Idempotent: the header is released at most once. Client payloads are
    /// returned still masked.
    pub fn cleanup(&mut self) -> Vec<BytesMut> {
        if let Some(header) = self.header.take() {
            self.allocator.release(header);
        }
        std::mem::take(&mut self.payload)
    }

    fn release_all(&self, buffers: Vec<BytesMut>) {
        for buf in buffers {
            self.allocator.release(buf);
        }
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        let payload = self.cleanup();
        self.release_all(payload);
    }
}
