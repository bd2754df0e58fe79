//! Connection-layer collaborators
//!
//! The framing core never touches a socket. It pulls bytes from a
//! [`ByteSource`], pushes formatted frames into a [`FrameSink`], hands
//! decoded messages to a [`MessageHandler`] and reports fatal conditions to
//! an [`ErrorReporter`]. [`IoSource`] and [`IoSink`] adapt any tokio
//! `AsyncRead`/`AsyncWrite` half.

use std::io::IoSlice;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::alloc::BufferAllocator;
use crate::error::{Error, Result};
use crate::message::{Fragment, Message};

/// Asynchronous supply of inbound bytes
#[allow(async_fn_in_trait)]
pub trait ByteSource {
    /// Next chunk of bytes, or `None` at end of stream
    async fn read_more(&mut self) -> Result<Option<BytesMut>>;
}

/// Asynchronous scatter write of outbound frames
#[allow(async_fn_in_trait)]
pub trait FrameSink {
    /// Write `slices` in order as one frame
    ///
    /// The slices may be advanced past what has been written.
    async fn write_frames(&mut self, slices: &mut [IoSlice<'_>]) -> Result<()>;
}

/// Receives decoded messages
pub trait MessageHandler {
    /// A complete text or binary message
    fn on_message_ready(&mut self, message: Message);

    /// One fragment of a message, when partial delivery is on
    fn on_partial_fragment(&mut self, fragment: Fragment) {
        trace!(
            kind = ?fragment.kind,
            len = fragment.payload.len(),
            is_last = fragment.is_last,
            "partial fragment ignored"
        );
    }

    /// A ping, pong or close, before the connection reacts to it
    fn on_control_frame(&mut self, _message: &Message) {}
}

/// Sink for fatal conditions that end the connection
pub trait ErrorReporter {
    /// Malformed frame or illegal sequencing
    fn report_protocol_error(&mut self, reason: &str) {
        warn!(reason, "protocol error");
    }

    /// Message exceeded the size limit
    fn report_message_too_large(&mut self, reason: &str) {
        warn!(reason, "message too large");
    }

    /// Decoder bookkeeping fault
    fn report_buffer_fault(&mut self, reason: &str) {
        warn!(reason, "buffer fault");
    }

    /// Route `err` to the matching sink
    fn report(&mut self, err: &Error) {
        match err {
            Error::Protocol(_) | Error::FrameFormat(_) => {
                self.report_protocol_error(&err.to_string())
            }
            Error::MessageTooLarge(reason) => self.report_message_too_large(reason),
            Error::BufferUnderrun { .. } | Error::InvalidState(_) => {
                self.report_buffer_fault(&err.to_string())
            }
            Error::Io(_) | Error::ConnectionClosed | Error::Timeout(_) => {
                warn!(error = %err, "connection failed");
            }
        }
    }
}

/// Reporter that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {}

/// [`ByteSource`] over a tokio reader
///
/// Each read lands in a fresh buffer from the allocator, since the decoder
/// keeps slices of earlier buffers alive until their message is handed out.
pub struct IoSource<R> {
    reader: R,
    allocator: Arc<dyn BufferAllocator>,
    read_size: usize,
}

impl<R> IoSource<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `reader`, requesting `read_size` byte buffers from `allocator`
    pub fn new(reader: R, allocator: Arc<dyn BufferAllocator>, read_size: usize) -> Self {
        Self {
            reader,
            allocator,
            read_size: read_size.max(1),
        }
    }

    /// Get the inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R> ByteSource for IoSource<R>
where
    R: AsyncRead + Unpin,
{
    async fn read_more(&mut self) -> Result<Option<BytesMut>> {
        let mut buf = self.allocator.allocate(self.read_size);
        let n = self.reader.read_buf(&mut buf).await?;
        if n == 0 {
            self.allocator.release(buf);
            return Ok(None);
        }
        trace!(n, "read");
        Ok(Some(buf))
    }
}

/// [`FrameSink`] over a tokio writer
pub struct IoSink<W> {
    writer: W,
}

impl<W> IoSink<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap `writer`
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Get the inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> FrameSink for IoSink<W>
where
    W: AsyncWrite + Unpin,
{
    async fn write_frames(&mut self, mut slices: &mut [IoSlice<'_>]) -> Result<()> {
        while !slices.is_empty() {
            let n = self.writer.write_vectored(slices).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            trace!(n, "wrote");
            IoSlice::advance_slices(&mut slices, n);
        }
        self.writer.flush().await?;
        Ok(())
    }
}
