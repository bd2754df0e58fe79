//! Error types for the framing engine

use std::io;

use thiserror::Error;

use crate::close::CloseCode;

/// Result type alias for framing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Framing error types
///
/// Every variant except [`Error::InvalidState`] ends the connection; see
/// [`Error::is_fatal`] and [`Error::close_code`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame header or illegal opcode sequencing
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Illegal FIN bit for the current fragmentation state
    #[error("frame format error: {0}")]
    FrameFormat(&'static str),
    /// The decoder ran out of registered bytes in the middle of a field
    #[error("buffer underrun: needed {needed} bytes, {available} available")]
    BufferUnderrun {
        /// Bytes the field required
        needed: usize,
        /// Bytes the registered buffers still held
        available: usize,
    },
    /// Message exceeded the configured size limit
    #[error("message too large: {0}")]
    MessageTooLarge(String),
    /// Operation invoked in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Byte source reached end of stream
    #[error("connection closed")]
    ConnectionClosed,
    /// A close-handshake wait expired
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

impl Error {
    /// Close code to send to the peer when this error ends the connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) | Error::FrameFormat(_) => CloseCode::PROTOCOL_ERROR,
            Error::MessageTooLarge(_) => CloseCode::TOO_BIG,
            Error::BufferUnderrun { .. } | Error::InvalidState(_) => CloseCode::INTERNAL,
            Error::Io(_) | Error::ConnectionClosed | Error::Timeout(_) => CloseCode::ABNORMAL,
        }
    }

    /// Whether the connection must be torn down
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidState(_))
    }

    /// Whether a close frame can still be written to the peer
    pub fn can_send_close(&self) -> bool {
        !matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(Error::Protocol("x").close_code(), 1002);
        assert_eq!(Error::FrameFormat("x").close_code(), 1002);
        assert_eq!(Error::MessageTooLarge("x".into()).close_code(), 1009);
        assert_eq!(
            Error::BufferUnderrun {
                needed: 2,
                available: 1
            }
            .close_code(),
            1011
        );
    }

    #[test]
    fn test_display() {
        let err = Error::BufferUnderrun {
            needed: 8,
            available: 3,
        };
        assert_eq!(err.to_string(), "buffer underrun: needed 8 bytes, 3 available");
        assert!(!Error::InvalidState("x").is_fatal());
        assert!(!Error::ConnectionClosed.can_send_close());
    }
}
