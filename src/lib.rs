//! # Sockudo-Framing: RFC 6455 WebSocket framing engine
//!
//! Incremental decoding of arbitrarily chunked byte streams into WebSocket
//! messages, and encoding of outbound messages into wire frames.
//!
//! ## Features
//!
//! - **Resumable Decoding**: frame headers may be split at any byte across reads
//! - **Zero-Copy Payloads**: messages are ordered lists of read-buffer slices
//! - **Fragmentation**: continuation sequencing with interleaved control frames
//! - **Early Size Limits**: oversized messages are rejected from the header
//! - **Injected Buffers**: every component takes an `Arc<dyn BufferAllocator>`
//! - **Tokio Driver**: auto-pong, close echo and a bounded close handshake
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sockudo_framing::prelude::*;
//!
//! let (reader, writer) = tokio::io::split(tcp_stream);
//! let mut driver = ConnectionDriver::from_io(
//!     reader,
//!     writer,
//!     Role::Server,
//!     Arc::new(Config::default()),
//!     BufferPool::shared(RECV_BUFFER_SIZE, 64),
//! );
//! let close = driver.run(&mut my_handler).await?;
//! ```

use std::time::Duration;

pub mod alloc;
pub mod assembler;
pub mod close;
pub mod connection;
pub mod decoder;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod mask;
pub mod message;

pub use crate::alloc::{BufferAllocator, BufferPool, HeapAllocator};
pub use assembler::{MessageAssembler, MessageFragmentState, ReadOutcome, SizeLimits};
pub use close::{CloseCode, CloseInfo};
pub use decoder::{DecodeOutcome, FrameDecodeState, FrameDecoder};
pub use driver::{ConnectionDriver, ConnectionState};
pub use encoder::{FrameEncoder, FrameRole, OutboundOpcode};
pub use error::{Error, Result};
pub use frame::{Frame, FrameHeader, OpCode, Role};
pub use message::{DataKind, Fragment, Message, Payload};

/// Default receive buffer size (64KB for high throughput)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Small message threshold (up to 125 bytes uses the 7-bit length field)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (up to 64KB uses the 16-bit length field)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum control frame payload
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Maximum close reason length (control payload minus the 2-byte code)
pub const MAX_CLOSE_REASON_LEN: usize = MAX_CONTROL_PAYLOAD - 2;

/// Slots the decoder's buffer list grows by when full
pub const BUFFER_LIST_GROWTH: usize = 10;

/// Default limit for a text or binary message (64MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// How long to wait for the peer's close frame
pub const CLOSE_FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a close frame write may take
pub const WRITE_TO_CLOSE_TIMEOUT: Duration = Duration::from_millis(5500);

/// How long a single read may take while closing
pub const READ_TO_CLOSE_TIMEOUT: Duration = Duration::from_millis(8500);

/// Shared configuration for WebSocket connections
///
/// Immutable once built; share it between connections behind an `Arc` and
/// specialise single connections with [`ConnectionOverrides`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_framing::Config;
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024)
///     .partial_delivery(true)
///     .close_frame_read_timeout(Duration::from_secs(5))
///     .build();
/// assert_eq!(config.max_text_message_size, 16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum text message size (default: 64MB)
    pub max_text_message_size: usize,
    /// Maximum binary message size (default: 64MB)
    pub max_binary_message_size: usize,
    /// Size of buffers requested for each read (default: 64KB)
    pub recv_buffer_size: usize,
    /// Deliver fragments as they arrive instead of whole messages (default: false)
    pub partial_delivery: bool,
    /// Overall wait for the peer's close frame (default: 30s)
    pub close_frame_read_timeout: Duration,
    /// Limit for writing a close frame (default: 5.5s)
    pub write_to_close_timeout: Duration,
    /// Limit for each read while awaiting a close reply (default: 8.5s)
    pub read_to_close_timeout: Duration,
    /// Growth step of the decoder's buffer list (default: 10)
    pub buffer_list_growth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_text_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_binary_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            recv_buffer_size: RECV_BUFFER_SIZE,
            partial_delivery: false,
            close_frame_read_timeout: CLOSE_FRAME_READ_TIMEOUT,
            write_to_close_timeout: WRITE_TO_CLOSE_TIMEOUT,
            read_to_close_timeout: READ_TO_CLOSE_TIMEOUT,
            buffer_list_growth: BUFFER_LIST_GROWTH,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the limit for both text and binary messages
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_text_message_size = size;
        self.config.max_binary_message_size = size;
        self
    }

    /// Set maximum text message size
    pub fn max_text_message_size(mut self, size: usize) -> Self {
        self.config.max_text_message_size = size;
        self
    }

    /// Set maximum binary message size
    pub fn max_binary_message_size(mut self, size: usize) -> Self {
        self.config.max_binary_message_size = size;
        self
    }

    /// Set receive buffer size
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Enable or disable partial delivery
    pub fn partial_delivery(mut self, enabled: bool) -> Self {
        self.config.partial_delivery = enabled;
        self
    }

    /// Set the overall close reply wait
    pub fn close_frame_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_frame_read_timeout = timeout;
        self
    }

    /// Set the close frame write limit
    pub fn write_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_to_close_timeout = timeout;
        self
    }

    /// Set the per-read limit while closing
    pub fn read_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_to_close_timeout = timeout;
        self
    }

    /// Set the decoder buffer list growth step
    pub fn buffer_list_growth(mut self, slots: usize) -> Self {
        self.config.buffer_list_growth = slots;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection overlay on a shared [`Config`]
///
/// Unset fields fall back to the shared config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOverrides {
    /// Limit replacing both message size limits
    pub max_message_size: Option<usize>,
    /// Partial delivery setting for this connection
    pub partial_delivery: Option<bool>,
}

impl ConnectionOverrides {
    /// Empty overlay
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the message size limit
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Override partial delivery
    pub fn partial_delivery(mut self, enabled: bool) -> Self {
        self.partial_delivery = Some(enabled);
        self
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::alloc::{BufferAllocator, BufferPool};
    pub use crate::close::{CloseCode, CloseInfo};
    pub use crate::connection::{ByteSource, ErrorReporter, FrameSink, MessageHandler};
    pub use crate::driver::ConnectionDriver;
    pub use crate::error::{Error, Result};
    pub use crate::frame::{OpCode, Role};
    pub use crate::message::{Fragment, Message, Payload};
    pub use crate::{Config, ConnectionOverrides, RECV_BUFFER_SIZE};
}
