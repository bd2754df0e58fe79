//! Message assembly
//!
//! Turns the stream of decoded frames into logical messages:
//! - fragmentation sequencing (FIN bit and continuation opcode rules)
//! - control frames interleaved between fragments of a data message
//! - size limits enforced from the frame header, before payload is buffered
//! - close payload validation
//! - optional fragment-by-fragment delivery

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::alloc::BufferAllocator;
use crate::close::{CloseInfo, parse_close_payload};
use crate::decoder::{DecodeOutcome, FrameDecoder};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameHeader, OpCode, Role};
use crate::message::{DataKind, Fragment, Message, Payload};
use crate::{Config, ConnectionOverrides};

/// Fragmentation position of the data message being assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFragmentState {
    /// No data message in progress
    ExpectingNew,
    /// Fragments were handed out already; more or the last one may follow
    ExpectingPartialOrLast,
    /// The message was a single frame
    FirstAndLast,
    /// The first of several frames arrived
    FirstOfMultiple,
    /// A middle frame arrived
    MiddleOfMultiple,
    /// The final frame arrived
    LastOfMultiple,
}

impl MessageFragmentState {
    /// Whether a fragmented data message is open
    #[inline]
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            MessageFragmentState::FirstOfMultiple
                | MessageFragmentState::MiddleOfMultiple
                | MessageFragmentState::ExpectingPartialOrLast
        )
    }
}

/// Result of one [`MessageAssembler::process_read`] call
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A logical message is ready; call [`MessageAssembler::reset`] after handling it
    Complete(Message),
    /// A fragment is ready for partial delivery
    ///
    /// When `is_last` is set the message is finished and
    /// [`MessageAssembler::reset`] must be called.
    PartialComplete(Fragment),
    /// More input is needed
    FrameIncomplete,
    /// A control frame arrived inside a fragmented data message; call
    /// [`MessageAssembler::reset_control_frame_parameters`] after handling it
    ControlMessageEmbedded(Message),
    /// A malformed close frame arrived while a close reply was awaited
    CloseFrameError(CloseInfo),
}

/// Maximum message sizes
///
/// Checked against the bytes the assembler holds. With partial delivery
/// each handed-out fragment empties that count, so a limit caps a single
/// fragment rather than the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    /// Limit for text messages
    pub max_text: u64,
    /// Limit for binary messages
    pub max_binary: u64,
    /// Limit registered by the consumer, replacing both of the above
    pub consumer_override: Option<u64>,
}

impl SizeLimits {
    /// Resolve limits from shared config and a per-connection overlay
    pub fn resolve(config: &Config, overrides: &ConnectionOverrides) -> Self {
        Self {
            max_text: config.max_text_message_size as u64,
            max_binary: config.max_binary_message_size as u64,
            consumer_override: overrides.max_message_size.map(|size| size as u64),
        }
    }

    /// Limit that applies to a message of `kind`
    #[inline]
    pub fn limit_for(&self, kind: DataKind) -> u64 {
        self.consumer_override.unwrap_or(match kind {
            DataKind::Text => self.max_text,
            DataKind::Binary => self.max_binary,
        })
    }
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self::resolve(&Config::default(), &ConnectionOverrides::default())
    }
}

/// Reassembles decoded frames into logical messages
pub struct MessageAssembler {
    decoder: FrameDecoder,
    allocator: Arc<dyn BufferAllocator>,
    fragment_state: MessageFragmentState,
    kind: Option<DataKind>,
    /// Data frames of the current message not yet handed out
    frames: Vec<Frame>,
    /// Payload bytes held in `frames`
    buffered: u64,
    /// Slices handed out in the last payload, recycled once the consumer is done
    delivered: Vec<Bytes>,
    limits: SizeLimits,
    partial_delivery: bool,
    /// Input not yet fed to the decoder, oldest first
    queued: VecDeque<BytesMut>,
    header_checked: bool,
    awaiting_reset: bool,
    awaiting_control_reset: bool,
    expect_close_reply: bool,
}

impl MessageAssembler {
    /// Create an assembler for the given role
    pub fn new(
        role: Role,
        limits: SizeLimits,
        partial_delivery: bool,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self::with_decoder(
            FrameDecoder::new(role.expects_masked_reads(), allocator.clone()),
            limits,
            partial_delivery,
            allocator,
        )
    }

    /// Create an assembler from shared config and a per-connection overlay
    pub fn from_config(
        role: Role,
        config: &Config,
        overrides: &ConnectionOverrides,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        let decoder = FrameDecoder::with_growth(
            role.expects_masked_reads(),
            allocator.clone(),
            config.buffer_list_growth,
        );
        Self::with_decoder(
            decoder,
            SizeLimits::resolve(config, overrides),
            overrides.partial_delivery.unwrap_or(config.partial_delivery),
            allocator,
        )
    }

    fn with_decoder(
        decoder: FrameDecoder,
        limits: SizeLimits,
        partial_delivery: bool,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self {
            decoder,
            allocator,
            fragment_state: MessageFragmentState::ExpectingNew,
            kind: None,
            frames: Vec::new(),
            buffered: 0,
            delivered: Vec::new(),
            limits,
            partial_delivery,
            queued: VecDeque::new(),
            header_checked: false,
            awaiting_reset: false,
            awaiting_control_reset: false,
            expect_close_reply: false,
        }
    }

    /// Current fragmentation state
    #[inline]
    pub fn fragment_state(&self) -> MessageFragmentState {
        self.fragment_state
    }

    /// Size limits in force
    #[inline]
    pub fn limits(&self) -> SizeLimits {
        self.limits
    }

    /// Replace the size limits (e.g. when a consumer registers its own)
    #[inline]
    pub fn set_limits(&mut self, limits: SizeLimits) {
        self.limits = limits;
    }

    /// Turn fragment-by-fragment delivery on or off
    #[inline]
    pub fn set_partial_delivery(&mut self, enabled: bool) {
        self.partial_delivery = enabled;
    }

    /// Whether fragments are delivered as they arrive
    #[inline]
    pub fn partial_delivery(&self) -> bool {
        self.partial_delivery
    }

    /// Mark that a close frame was sent and its reply is awaited
    ///
    /// An oversized close frame then yields [`ReadOutcome::CloseFrameError`]
    /// instead of a protocol error.
    #[inline]
    pub fn expect_close_reply(&mut self, expecting: bool) {
        self.expect_close_reply = expecting;
    }

    /// Whether input is queued that has not been decoded yet
    #[inline]
    pub fn has_queued_input(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Feed `input` (if any) and decode until an outcome is available
    ///
    /// Input left over after a completed message stays queued and is
    /// decoded by the next call, so callers should only read more bytes
    /// after [`ReadOutcome::FrameIncomplete`]. On a fatal error everything
    /// held for the message and the queued input is released.
    pub fn process_read(&mut self, input: Option<BytesMut>) -> Result<ReadOutcome> {
        if let Some(buf) = input {
            self.queued.push_back(buf);
        }
        if self.awaiting_reset {
            return Err(Error::InvalidState(
                "reset must be called after a completed message",
            ));
        }
        if self.awaiting_control_reset {
            return Err(Error::InvalidState(
                "reset_control_frame_parameters must be called after an embedded control frame",
            ));
        }
        self.recycle_delivered();

        match self.drive() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if err.is_fatal() {
                    self.abandon();
                }
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<ReadOutcome> {
        loop {
            let Some(buf) = self.queued.pop_front() else {
                return Ok(ReadOutcome::FrameIncomplete);
            };

            let outcome = match self.decoder.process_next_buffer(buf) {
                Ok(outcome) => outcome,
                Err(err) => return self.decode_failed(err),
            };

            match outcome {
                DecodeOutcome::Incomplete => {
                    self.check_header()?;
                    continue;
                }
                DecodeOutcome::ExactlyComplete => {}
                DecodeOutcome::NextFrameAt(offset) => {
                    trace!(offset, "next frame starts inside the current buffer");
                    if let Some(rest) = self.decoder.take_remainder() {
                        self.queued.push_front(rest);
                    }
                }
                DecodeOutcome::AlreadyComplete(buf) => {
                    self.queued.push_front(buf);
                    return Err(Error::InvalidState("decoder holds an unconsumed frame"));
                }
            }

            self.check_header()?;
            self.header_checked = false;

            let mut frame = self.decoder.take_frame()?;
            frame.unmask();

            if let Some(outcome) = self.handle_frame(frame)? {
                return Ok(outcome);
            }
        }
    }

    /// Validate sequencing and size as soon as the header is known
    fn check_header(&mut self) -> Result<()> {
        if self.header_checked {
            return Ok(());
        }
        let Some(header) = self.decoder.header() else {
            return Ok(());
        };
        self.header_checked = true;

        if header.opcode.is_control() {
            return Ok(());
        }
        self.next_fragment_state(&header)?;

        let kind = match header.opcode {
            OpCode::Continuation => self.kind,
            opcode => DataKind::from_opcode(opcode),
        }
        .ok_or(Error::InvalidState("data frame without a message kind"))?;

        let limit = self.limits.limit_for(kind);
        let total = self.buffered.saturating_add(header.payload_len);
        if total > limit {
            debug!(?kind, total, limit, "message exceeds size limit");
            return Err(Error::MessageTooLarge(format!(
                "{} message of at least {} bytes exceeds the maximum of {} bytes",
                match kind {
                    DataKind::Text => "text",
                    DataKind::Binary => "binary",
                },
                total,
                limit
            )));
        }
        Ok(())
    }

    fn decode_failed(&mut self, err: Error) -> Result<ReadOutcome> {
        if let Error::Protocol(reason) = err {
            if self.expect_close_reply && self.decoder.current_opcode() == Some(OpCode::Close) {
                debug!(reason, "malformed close frame while awaiting close reply");
                self.abandon();
                return Ok(ReadOutcome::CloseFrameError(CloseInfo::protocol_error(reason)));
            }
        }
        Err(err)
    }

    /// Fragment state after accepting a data frame with `header`
    fn next_fragment_state(&self, header: &FrameHeader) -> Result<MessageFragmentState> {
        use MessageFragmentState::*;

        let in_progress = self.fragment_state.in_progress();
        if header.opcode == OpCode::Continuation && !in_progress {
            return Err(Error::Protocol(
                "continuation frame without a message in progress",
            ));
        }
        if header.opcode != OpCode::Continuation && in_progress {
            return Err(Error::Protocol(
                "expected continuation frame inside a fragmented message",
            ));
        }

        if header.fin {
            match self.fragment_state {
                ExpectingNew => Ok(FirstAndLast),
                FirstOfMultiple | MiddleOfMultiple | ExpectingPartialOrLast => Ok(LastOfMultiple),
                _ => Err(Error::FrameFormat("final frame without an open message")),
            }
        } else {
            match self.fragment_state {
                ExpectingNew => Ok(FirstOfMultiple),
                FirstOfMultiple => Ok(MiddleOfMultiple),
                state @ (MiddleOfMultiple | ExpectingPartialOrLast) => Ok(state),
                _ => Err(Error::FrameFormat("non-final frame after the message ended")),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<ReadOutcome>> {
        if frame.is_control() {
            return Ok(Some(self.handle_control(frame)));
        }

        let next = self.next_fragment_state(&frame.header)?;
        if let Some(kind) = DataKind::from_opcode(frame.opcode()) {
            self.kind = Some(kind);
        }
        let kind = self
            .kind
            .ok_or(Error::InvalidState("data frame without a message kind"))?;

        self.buffered += frame.payload_len();
        self.frames.push(frame);
        self.fragment_state = next;

        match next {
            MessageFragmentState::FirstAndLast | MessageFragmentState::LastOfMultiple => {
                self.awaiting_reset = true;
                let payload = self.gather_up();
                debug!(?kind, len = payload.len(), "message complete");
                if self.partial_delivery && next == MessageFragmentState::LastOfMultiple {
                    return Ok(Some(ReadOutcome::PartialComplete(Fragment {
                        kind,
                        payload,
                        is_last: true,
                    })));
                }
                let message = match kind {
                    DataKind::Text => Message::Text(payload),
                    DataKind::Binary => Message::Binary(payload),
                };
                Ok(Some(ReadOutcome::Complete(message)))
            }
            _ if self.partial_delivery => {
                let payload = self.gather_up();
                self.fragment_state = MessageFragmentState::ExpectingPartialOrLast;
                trace!(?kind, len = payload.len(), "fragment ready");
                Ok(Some(ReadOutcome::PartialComplete(Fragment {
                    kind,
                    payload,
                    is_last: false,
                })))
            }
            _ => Ok(None),
        }
    }

    fn handle_control(&mut self, frame: Frame) -> ReadOutcome {
        let message = match frame.opcode() {
            OpCode::Ping => Message::Ping(self.hand_out(frame.into_payload())),
            OpCode::Pong => Message::Pong(self.hand_out(frame.into_payload())),
            _ => {
                let info = parse_close_payload(&frame.contiguous_payload());
                for buf in frame.into_buffers() {
                    self.allocator.release(buf);
                }
                Message::Close(info)
            }
        };

        if self.fragment_state.in_progress() {
            trace!(kind = ?message.control_kind(), "control frame inside fragmented message");
            self.awaiting_control_reset = true;
            ReadOutcome::ControlMessageEmbedded(message)
        } else {
            self.awaiting_reset = true;
            ReadOutcome::Complete(message)
        }
    }

    /// Move the buffered payload out as one ordered list of slices
    ///
    /// The assembler keeps a handle on each slice so the read buffers can go
    /// back to the allocator after the consumer has dropped the payload.
    fn gather_up(&mut self) -> Payload {
        let chunks: Vec<Bytes> = self
            .frames
            .drain(..)
            .flat_map(Frame::into_payload)
            .collect();
        self.buffered = 0;
        self.hand_out(chunks)
    }

    fn hand_out(&mut self, chunks: Vec<Bytes>) -> Payload {
        self.delivered.extend(chunks.iter().cloned());
        Payload::from_chunks(chunks)
    }

    /// Return handed-out slices the consumer no longer holds
    fn recycle_delivered(&mut self) {
        for chunk in self.delivered.drain(..) {
            if let Ok(buf) = chunk.try_into_mut() {
                self.allocator.release(buf);
            }
        }
    }

    /// Release everything held for the completed or abandoned message
    ///
    /// Restores [`MessageFragmentState::ExpectingNew`]. Queued input that
    /// belongs to later frames is kept. Payload slices of the message go back
    /// to the allocator if the consumer has already dropped them; call this
    /// after handling the message.
    pub fn reset(&mut self) {
        self.recycle_delivered();
        for frame in self.frames.drain(..) {
            for buf in frame.into_buffers() {
                self.allocator.release(buf);
            }
        }
        self.decoder.reset();
        self.fragment_state = MessageFragmentState::ExpectingNew;
        self.kind = None;
        self.buffered = 0;
        self.header_checked = false;
        self.awaiting_reset = false;
        self.awaiting_control_reset = false;
    }

    /// Clear an embedded control frame without touching the data message
    pub fn reset_control_frame_parameters(&mut self) {
        self.awaiting_control_reset = false;
        self.header_checked = false;
    }

    /// Drop the current message and all queued input after a fatal error
    fn abandon(&mut self) {
        self.reset();
        for buf in self.queued.drain(..) {
            self.allocator.release(buf);
        }
    }
}

impl Drop for MessageAssembler {
    fn drop(&mut self) {
        self.abandon();
    }
}
