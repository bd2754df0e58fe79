//! Per-connection driver
//!
//! Runs the read loop over a [`ByteSource`], answers pings and close
//! frames, and owns the write path through a single [`FrameEncoder`]. Reads
//! and writes are serialized by `&mut self`.
//!
//! Any fatal error is reported to the [`ErrorReporter`] and, when the
//! transport still works, answered with a close frame carrying
//! [`Error::close_code`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::alloc::BufferAllocator;
use crate::assembler::{MessageAssembler, ReadOutcome};
use crate::close::{CloseInfo, close_reply_payload};
use crate::connection::{
    ByteSource, ErrorReporter, FrameSink, IoSink, IoSource, LogReporter, MessageHandler,
};
use crate::encoder::{FrameEncoder, FrameRole, OutboundOpcode};
use crate::error::{Error, Result};
use crate::frame::Role;
use crate::message::{DataKind, Message, Payload};
use crate::{Config, ConnectionOverrides};

/// Close handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Messages flow both ways
    Open,
    /// A close frame was sent, the reply is pending
    CloseSent,
    /// The connection is finished
    Closed,
}

enum Flow {
    Continue,
    Closed(Option<CloseInfo>),
}

/// Drives one WebSocket connection over a byte source and a frame sink
pub struct ConnectionDriver<S, W> {
    source: S,
    sink: W,
    role: Role,
    config: Arc<Config>,
    allocator: Arc<dyn BufferAllocator>,
    assembler: MessageAssembler,
    encoder: FrameEncoder,
    reporter: Box<dyn ErrorReporter + Send>,
    state: ConnectionState,
}

impl<R, W> ConnectionDriver<IoSource<R>, IoSink<W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a driver over tokio reader and writer halves
    pub fn from_io(
        reader: R,
        writer: W,
        role: Role,
        config: Arc<Config>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        let source = IoSource::new(reader, allocator.clone(), config.recv_buffer_size);
        Self::new(source, IoSink::new(writer), role, config, allocator)
    }
}

impl<S, W> ConnectionDriver<S, W>
where
    S: ByteSource,
    W: FrameSink,
{
    /// Create a driver with the shared config and no per-connection overrides
    pub fn new(
        source: S,
        sink: W,
        role: Role,
        config: Arc<Config>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self::with_overrides(
            source,
            sink,
            role,
            config,
            &ConnectionOverrides::default(),
            allocator,
        )
    }

    /// Create a driver with a per-connection overlay on the shared config
    pub fn with_overrides(
        source: S,
        sink: W,
        role: Role,
        config: Arc<Config>,
        overrides: &ConnectionOverrides,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        let assembler = MessageAssembler::from_config(role, &config, overrides, allocator.clone());
        Self {
            source,
            sink,
            role,
            config,
            encoder: FrameEncoder::new(allocator.clone()),
            allocator,
            assembler,
            reporter: Box::new(LogReporter),
            state: ConnectionState::Open,
        }
    }

    /// Replace the error reporter
    pub fn set_reporter(&mut self, reporter: impl ErrorReporter + Send + 'static) {
        self.reporter = Box::new(reporter);
    }

    /// Close handshake progress
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The assembler, e.g. to change size limits mid-connection
    #[inline]
    pub fn assembler_mut(&mut self) -> &mut MessageAssembler {
        &mut self.assembler
    }

    /// Read and dispatch messages until the peer closes
    ///
    /// Pings are answered with pongs and a received close is echoed.
    /// Returns the peer's close info (`None` if it sent no status code).
    pub async fn run<H>(&mut self, handler: &mut H) -> Result<Option<CloseInfo>>
    where
        H: MessageHandler,
    {
        self.ensure_open()?;

        let mut input = None;
        loop {
            let outcome = match self.assembler.process_read(input.take()) {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.fail(err).await),
            };

            match outcome {
                ReadOutcome::FrameIncomplete => {
                    input = match self.source.read_more().await {
                        Ok(Some(buf)) => Some(buf),
                        Ok(None) => return Err(self.fail(Error::ConnectionClosed).await),
                        Err(err) => return Err(self.fail(err).await),
                    };
                }
                ReadOutcome::Complete(message) => {
                    let flow = if message.is_control() {
                        self.on_control(message, handler).await?
                    } else {
                        handler.on_message_ready(message);
                        Flow::Continue
                    };
                    // Only after the handler has dropped or kept the message
                    self.assembler.reset();
                    if let Flow::Closed(info) = flow {
                        return Ok(info);
                    }
                }
                ReadOutcome::PartialComplete(fragment) => {
                    let is_last = fragment.is_last;
                    handler.on_partial_fragment(fragment);
                    if is_last {
                        self.assembler.reset();
                    }
                }
                ReadOutcome::ControlMessageEmbedded(message) => {
                    self.assembler.reset_control_frame_parameters();
                    if let Flow::Closed(info) = self.on_control(message, handler).await? {
                        return Ok(info);
                    }
                }
                ReadOutcome::CloseFrameError(info) => {
                    self.state = ConnectionState::Closed;
                    return Ok(Some(info));
                }
            }
        }
    }

    async fn on_control<H>(&mut self, message: Message, handler: &mut H) -> Result<Flow>
    where
        H: MessageHandler,
    {
        handler.on_control_frame(&message);

        match message {
            Message::Ping(payload) => {
                trace!(len = payload.len(), "answering ping");
                let buffers = self.copy_payload(&payload);
                if let Err(err) = self.write_frame(buffers, OutboundOpcode::Pong).await {
                    return Err(self.fail(err).await);
                }
                Ok(Flow::Continue)
            }
            Message::Close(info) => {
                debug!(code = ?info.as_ref().map(|i| i.code), "close received");
                let buffers = self.copy_chunks(&[close_reply_payload(info.as_ref())]);
                let limit = self.config.write_to_close_timeout;
                match timeout(limit, self.write_frame(buffers, OutboundOpcode::Close)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!(error = %err, "close reply not sent"),
                    Err(_) => debug!("close reply write timed out"),
                }
                self.state = ConnectionState::Closed;
                Ok(Flow::Closed(info))
            }
            _ => Ok(Flow::Continue),
        }
    }

    /// Send a whole message
    ///
    /// A close message starts the close handshake, see [`ConnectionDriver::close`].
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.ensure_open()?;

        let (opcode, payload) = match message {
            Message::Text(p) => (OutboundOpcode::Text(FrameRole::Whole), p),
            Message::Binary(p) => (OutboundOpcode::Binary(FrameRole::Whole), p),
            Message::Ping(p) => (OutboundOpcode::Ping, p),
            Message::Pong(p) => (OutboundOpcode::Pong, p),
            Message::Close(info) => {
                return self
                    .close(info.unwrap_or_else(CloseInfo::normal))
                    .await
                    .map(drop);
            }
        };

        let buffers = self.copy_payload(&payload);
        self.send_frame(buffers, opcode).await
    }

    /// Send one fragment of a data message
    pub async fn send_fragment(
        &mut self,
        kind: DataKind,
        payload: impl Into<Bytes>,
        role: FrameRole,
    ) -> Result<()> {
        self.ensure_open()?;
        let buffers = self.copy_chunks(&[payload.into()]);
        self.send_frame(buffers, OutboundOpcode::data(kind, role))
            .await
    }

    /// Start the close handshake and wait for the peer's reply
    ///
    /// The close frame write is bounded by `write_to_close_timeout`, each
    /// read of the reply by `read_to_close_timeout`, and the whole wait by
    /// `close_frame_read_timeout`. Data arriving meanwhile is discarded.
    pub async fn close(&mut self, info: CloseInfo) -> Result<Option<CloseInfo>> {
        self.ensure_open()?;
        self.state = ConnectionState::CloseSent;
        debug!(code = info.code, reason = %info.reason, "sending close");

        let limit = self.config.write_to_close_timeout;
        let write = self.write_frame(vec![info.to_payload()], OutboundOpcode::Close);
        let written = match timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("writing close frame")),
        };
        if let Err(err) = written {
            self.state = ConnectionState::Closed;
            return Err(err);
        }

        self.assembler.expect_close_reply(true);
        let reply = match timeout(self.config.close_frame_read_timeout, self.await_close_reply()).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("waiting for close reply")),
        };
        self.assembler.expect_close_reply(false);
        self.state = ConnectionState::Closed;

        if let Ok(info) = &reply {
            debug!(code = ?info.as_ref().map(|i| i.code), "close handshake complete");
        }
        reply
    }

    async fn await_close_reply(&mut self) -> Result<Option<CloseInfo>> {
        let mut input = None;
        loop {
            match self.assembler.process_read(input.take())? {
                ReadOutcome::FrameIncomplete => {
                    let read = timeout(self.config.read_to_close_timeout, self.source.read_more())
                        .await
                        .map_err(|_| Error::Timeout("reading close reply"))??;
                    match read {
                        Some(buf) => input = Some(buf),
                        None => return Err(Error::ConnectionClosed),
                    }
                }
                ReadOutcome::Complete(Message::Close(info))
                | ReadOutcome::ControlMessageEmbedded(Message::Close(info)) => {
                    self.assembler.reset();
                    return Ok(info);
                }
                ReadOutcome::CloseFrameError(info) => return Ok(Some(info)),
                ReadOutcome::Complete(_) => {
                    trace!("discarding message received while closing");
                    self.assembler.reset();
                }
                ReadOutcome::PartialComplete(fragment) => {
                    if fragment.is_last {
                        self.assembler.reset();
                    }
                }
                ReadOutcome::ControlMessageEmbedded(_) => {
                    self.assembler.reset_control_frame_parameters();
                }
            }
        }
    }

    /// Report a fatal error and send a close frame while that is still possible
    async fn fail(&mut self, err: Error) -> Error {
        if !err.is_fatal() {
            return err;
        }
        self.reporter.report(&err);

        if err.can_send_close() && self.state == ConnectionState::Open {
            let info = CloseInfo::new(err.close_code(), err.to_string());
            let limit = self.config.write_to_close_timeout;
            let write = self.write_frame(vec![info.to_payload()], OutboundOpcode::Close);
            match timeout(limit, write).await {
                Ok(Ok(())) => debug!(code = info.code, "close frame sent after error"),
                Ok(Err(write_err)) => debug!(error = %write_err, "close frame not sent"),
                Err(_) => debug!("close frame write timed out"),
            }
        }
        self.state = ConnectionState::Closed;
        err
    }

    async fn send_frame(&mut self, buffers: Vec<BytesMut>, opcode: OutboundOpcode) -> Result<()> {
        let result = self.write_frame(buffers, opcode).await;
        if let Err(Error::Io(_)) = &result {
            self.state = ConnectionState::Closed;
        }
        result
    }

    async fn write_frame(&mut self, buffers: Vec<BytesMut>, opcode: OutboundOpcode) -> Result<()> {
        self.encoder
            .format(buffers, opcode, self.role.masks_writes())?;
        let mut slices = self.encoder.io_slices();
        let result = self.sink.write_frames(&mut slices).await;
        for buf in self.encoder.cleanup() {
            self.allocator.release(buf);
        }
        result
    }

    fn copy_payload(&self, payload: &Payload) -> Vec<BytesMut> {
        self.copy_chunks(payload.chunks())
    }

    /// Copy into allocator buffers the encoder may mask in place
    fn copy_chunks(&self, chunks: &[Bytes]) -> Vec<BytesMut> {
        chunks
            .iter()
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| {
                let mut buf = self.allocator.allocate(chunk.len());
                buf.extend_from_slice(chunk);
                buf
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Open => Ok(()),
            _ => Err(Error::InvalidState("connection is closing or closed")),
        }
    }
}
