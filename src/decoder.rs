//! Incremental frame decoder
//!
//! The decoder is fed whole read buffers, one at a time, for the frame it
//! is currently decoding. Header fields are read through a single cursor
//! that walks the registered buffers in order, so a field may straddle any
//! number of buffer boundaries. Payload bytes are only counted, never read
//! or moved, until the frame is handed out by [`FrameDecoder::take_frame`].

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::alloc::BufferAllocator;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameHeader, OpCode};
use crate::{BUFFER_LIST_GROWTH, MAX_CONTROL_PAYLOAD};

/// Decoder position within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeState {
    /// Waiting for the two base header bytes
    Init,
    /// Waiting for the 16-bit extended length
    Find16BitLength,
    /// Waiting for the 64-bit extended length
    Find64BitLength,
    /// Waiting for the masking key
    FindMask,
    /// Counting payload bytes
    FindPayload,
    /// All payload bytes have arrived
    PayloadComplete,
}

/// Result of feeding one buffer to the decoder
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// More bytes are needed
    Incomplete,
    /// The frame ends exactly at the end of the buffer
    ExactlyComplete,
    /// The decoder already holds a complete frame; the buffer is handed back untouched
    AlreadyComplete(BytesMut),
    /// The frame ends inside the buffer; the next frame starts at this offset
    ///
    /// The bytes from the offset on are available from
    /// [`FrameDecoder::take_remainder`].
    NextFrameAt(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    index: usize,
    pos: usize,
}

/// Resumable RFC 6455 frame header parser
pub struct FrameDecoder {
    state: FrameDecodeState,
    /// Whether peer frames must be masked (server-side reads)
    expect_masked: bool,
    allocator: Arc<dyn BufferAllocator>,
    growth: usize,
    /// Buffers registered for the current frame, in arrival order
    buffers: Vec<BytesMut>,
    cursor: Cursor,
    fin: bool,
    rsv: u8,
    opcode: Option<OpCode>,
    masked: bool,
    payload_len: u64,
    mask: Option<[u8; 4]>,
    payload_start: Cursor,
    /// Payload bytes registered so far
    payload_seen: u64,
    /// Bytes of the last buffer that belong to the next frame
    remainder: Option<BytesMut>,
}

impl FrameDecoder {
    /// Create a decoder
    ///
    /// `expect_masked` is true for server-side reads.
    pub fn new(expect_masked: bool, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self::with_growth(expect_masked, allocator, BUFFER_LIST_GROWTH)
    }

    /// Create a decoder whose buffer list grows by `growth` slots at a time
    pub fn with_growth(
        expect_masked: bool,
        allocator: Arc<dyn BufferAllocator>,
        growth: usize,
    ) -> Self {
        let growth = growth.max(1);
        Self {
            state: FrameDecodeState::Init,
            expect_masked,
            allocator,
            growth,
            buffers: Vec::with_capacity(growth),
            cursor: Cursor::default(),
            fin: false,
            rsv: 0,
            opcode: None,
            masked: false,
            payload_len: 0,
            mask: None,
            payload_start: Cursor::default(),
            payload_seen: 0,
            remainder: None,
        }
    }

    /// Current decode state
    #[inline]
    pub fn state(&self) -> FrameDecodeState {
        self.state
    }

    /// Opcode of the current frame, once the base header has been read
    ///
    /// Stays available after a validation error so the caller can tell
    /// which kind of frame was rejected.
    #[inline]
    pub fn current_opcode(&self) -> Option<OpCode> {
        self.opcode
    }

    /// The parsed header, once length and mask are known
    pub fn header(&self) -> Option<FrameHeader> {
        match self.state {
            FrameDecodeState::FindPayload | FrameDecodeState::PayloadComplete => {
                Some(FrameHeader {
                    fin: self.fin,
                    rsv: self.rsv,
                    opcode: self.opcode?,
                    masked: self.masked,
                    payload_len: self.payload_len,
                    mask: self.mask,
                })
            }
            _ => None,
        }
    }

    /// Number of buffers registered for the current frame
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Feed the next buffer for the current frame
    pub fn process_next_buffer(&mut self, buf: BytesMut) -> Result<DecodeOutcome> {
        if self.state == FrameDecodeState::PayloadComplete {
            return Ok(DecodeOutcome::AlreadyComplete(buf));
        }
        if buf.is_empty() {
            self.allocator.release(buf);
            return Ok(DecodeOutcome::Incomplete);
        }

        if self.buffers.len() == self.buffers.capacity() {
            self.buffers.reserve_exact(self.growth);
        }
        if self.state == FrameDecodeState::FindPayload {
            self.payload_seen += buf.len() as u64;
        }
        self.buffers.push(buf);

        self.advance()
    }

    fn advance(&mut self) -> Result<DecodeOutcome> {
        loop {
            match self.state {
                FrameDecodeState::Init => {
                    if self.available() < 2 {
                        return Ok(DecodeOutcome::Incomplete);
                    }
                    let [b0, b1] = self.read_field::<2>()?;
                    self.parse_base_header(b0, b1)?;
                }
                FrameDecodeState::Find16BitLength => {
                    if self.available() < 2 {
                        return Ok(DecodeOutcome::Incomplete);
                    }
                    self.payload_len = self.read_u16()? as u64;
                    self.length_known();
                }
                FrameDecodeState::Find64BitLength => {
                    if self.available() < 8 {
                        return Ok(DecodeOutcome::Incomplete);
                    }
                    // Most significant bit is ignored
                    self.payload_len = self.read_u64()? & (u64::MAX >> 1);
                    self.length_known();
                }
                FrameDecodeState::FindMask => {
                    if self.available() < 4 {
                        return Ok(DecodeOutcome::Incomplete);
                    }
                    self.mask = Some(self.read_u32()?.to_be_bytes());
                    self.enter_payload();
                }
                FrameDecodeState::FindPayload => {
                    if self.payload_seen < self.payload_len {
                        return Ok(DecodeOutcome::Incomplete);
                    }
                    return self.complete();
                }
                FrameDecodeState::PayloadComplete => {
                    return Err(Error::InvalidState("decoder advanced past a complete frame"));
                }
            }
        }
    }

    fn parse_base_header(&mut self, b0: u8, b1: u8) -> Result<()> {
        self.fin = b0 & 0x80 != 0;
        self.rsv = (b0 >> 4) & 0x07;
        let raw_opcode = b0 & 0x0F;
        self.masked = b1 & 0x80 != 0;
        let len_byte = b1 & 0x7F;

        if self.rsv != 0 {
            debug!(rsv = self.rsv, "rejecting frame with reserved bits set");
            return Err(Error::Protocol("RSV bits must be 0 (no extensions negotiated)"));
        }

        let opcode = OpCode::from_u8(raw_opcode).ok_or_else(|| {
            debug!(opcode = raw_opcode, "rejecting frame with reserved opcode");
            Error::Protocol("reserved opcode")
        })?;
        self.opcode = Some(opcode);

        if opcode.is_control() {
            if !self.fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if len_byte as usize > MAX_CONTROL_PAYLOAD {
                debug!(?opcode, "rejecting oversized control frame");
                return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
            }
        }

        if self.expect_masked && !self.masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.expect_masked && self.masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }

        match len_byte {
            126 => self.state = FrameDecodeState::Find16BitLength,
            127 => self.state = FrameDecodeState::Find64BitLength,
            len => {
                self.payload_len = len as u64;
                self.length_known();
            }
        }
        Ok(())
    }

    fn length_known(&mut self) {
        if self.masked {
            self.state = FrameDecodeState::FindMask;
        } else {
            self.enter_payload();
        }
    }

    fn enter_payload(&mut self) {
        trace!(
            opcode = ?self.opcode,
            fin = self.fin,
            masked = self.masked,
            payload_len = self.payload_len,
            "frame header decoded"
        );
        self.payload_start = self.cursor;
        self.payload_seen = self.available() as u64;
        self.state = FrameDecodeState::FindPayload;
    }

    fn complete(&mut self) -> Result<DecodeOutcome> {
        let excess = self.payload_seen - self.payload_len;
        self.state = FrameDecodeState::PayloadComplete;
        if excess == 0 {
            return Ok(DecodeOutcome::ExactlyComplete);
        }

        let last = self
            .buffers
            .last_mut()
            .ok_or(Error::InvalidState("complete frame without buffers"))?;
        let offset = (last.len() as u64)
            .checked_sub(excess)
            .ok_or(Error::InvalidState("next frame starts before the last buffer"))?
            as usize;
        self.remainder = Some(last.split_off(offset));
        self.payload_seen = self.payload_len;
        Ok(DecodeOutcome::NextFrameAt(offset))
    }

    /// Take the bytes that follow the completed frame in the last buffer
    #[inline]
    pub fn take_remainder(&mut self) -> Option<BytesMut> {
        self.remainder.take()
    }

    /// Hand out the completed frame and get ready for the next one
    ///
    /// Header bytes are released to the allocator; the payload slices move
    /// into the returned frame. Any remainder not yet taken is kept.
    pub fn take_frame(&mut self) -> Result<Frame> {
        if self.state != FrameDecodeState::PayloadComplete {
            return Err(Error::InvalidState("frame is not complete"));
        }
        let header = self
            .header()
            .ok_or(Error::InvalidState("frame header missing"))?;

        let start = self.payload_start;
        let mut payload = Vec::with_capacity(self.buffers.len() - start.index.min(self.buffers.len()));
        for (i, mut buf) in self.buffers.drain(..).enumerate() {
            if i < start.index {
                self.allocator.release(buf);
                continue;
            }
            if i == start.index && start.pos > 0 {
                let header_bytes = buf.split_to(start.pos);
                self.allocator.release(header_bytes);
            }
            if buf.is_empty() {
                self.allocator.release(buf);
            } else {
                payload.push(buf);
            }
        }
        debug_assert_eq!(
            payload.iter().map(|b| b.len() as u64).sum::<u64>(),
            header.payload_len
        );

        self.clear_frame_state();
        Ok(Frame::from_parts(header, payload))
    }

    /// Abandon the current frame, releasing every buffer it holds
    pub fn reset(&mut self) {
        for buf in self.buffers.drain(..) {
            self.allocator.release(buf);
        }
        if let Some(rest) = self.remainder.take() {
            self.allocator.release(rest);
        }
        self.clear_frame_state();
    }

    fn clear_frame_state(&mut self) {
        self.state = FrameDecodeState::Init;
        self.cursor = Cursor::default();
        self.payload_start = Cursor::default();
        self.fin = false;
        self.rsv = 0;
        self.opcode = None;
        self.masked = false;
        self.payload_len = 0;
        self.mask = None;
        self.payload_seen = 0;
    }

    /// Unread bytes from the cursor to the end of the last buffer
    fn available(&self) -> usize {
        self.buffers
            .iter()
            .skip(self.cursor.index)
            .map(BytesMut::len)
            .sum::<usize>()
            .saturating_sub(self.cursor.pos)
    }

    fn grab_next_byte(&mut self) -> Result<u8> {
        while let Some(buf) = self.buffers.get(self.cursor.index) {
            if self.cursor.pos < buf.len() {
                let byte = buf[self.cursor.pos];
                self.cursor.pos += 1;
                return Ok(byte);
            }
            self.cursor.index += 1;
            self.cursor.pos = 0;
        }
        Err(Error::BufferUnderrun {
            needed: 1,
            available: 0,
        })
    }

    fn read_field<const N: usize>(&mut self) -> Result<[u8; N]> {
        let available = self.available();
        if available < N {
            return Err(Error::BufferUnderrun {
                needed: N,
                available,
            });
        }
        let mut field = [0u8; N];
        for byte in field.iter_mut() {
            *byte = self.grab_next_byte()?;
        }
        Ok(field)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_field::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_field::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_field::<8>()?))
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.reset();
    }
}
