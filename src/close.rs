//! Close frame payloads (RFC 6455 Section 5.5.1 and 7.4)
//!
//! A received close payload is never rejected outright. Codes the peer is
//! not allowed to send are rewritten to 1002 and an undecodable reason to
//! 1007, so the connection always has a valid close frame to answer with.

use bytes::{BufMut, Bytes, BytesMut};

use crate::MAX_CLOSE_REASON_LEN;

/// Close status codes
pub struct CloseCode;

impl CloseCode {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Reserved, never sent on the wire
    pub const RESERVED: u16 = 1004;
    /// No status received, never sent on the wire
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure, never sent on the wire
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Whether a peer may put `code` in a close frame
    ///
    /// Rejects 1004-1006, anything below 1000 and the unassigned range
    /// 1012..=2999. Everything from 3000 up passes through.
    #[inline]
    pub fn is_valid_received(code: u16) -> bool {
        !(code < 1000 || matches!(code, 1004..=1006) || (1012..3000).contains(&code))
    }
}

/// Reason sent when a close payload carries exactly one byte
pub const ONE_BYTE_CLOSE_REASON: &str = "close frame payload must be zero or at least two bytes";

/// Reason sent when a close reason is not valid UTF-8
pub const INVALID_UTF8_CLOSE_REASON: &str = "close reason is not valid UTF-8";

/// Code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close status code
    pub code: u16,
    /// UTF-8 reason, at most 123 bytes
    pub reason: String,
}

impl CloseInfo {
    /// Create a close info, truncating the reason to 123 bytes on a char boundary
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_LEN {
            let mut end = MAX_CLOSE_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    /// Normal closure without a reason
    pub fn normal() -> Self {
        Self::new(CloseCode::NORMAL, "")
    }

    /// Protocol error with the given reason
    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::PROTOCOL_ERROR, reason)
    }

    /// Encode as a close frame payload (code followed by reason)
    pub fn to_payload(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code);
        buf.put_slice(self.reason.as_bytes());
        buf
    }
}

/// Parse a received close frame payload
///
/// Returns `None` for an empty payload (no status code). Invalid codes,
/// a one-byte payload and a non-UTF-8 reason are downgraded to substitute
/// codes rather than reported as errors.
pub fn parse_close_payload(payload: &[u8]) -> Option<CloseInfo> {
    match payload.len() {
        0 => None,
        1 => Some(CloseInfo::protocol_error(ONE_BYTE_CLOSE_REASON)),
        len => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid_received(code) {
                return Some(CloseInfo::protocol_error(format!(
                    "received invalid close code {code}"
                )));
            }

            let end = len.min(2 + MAX_CLOSE_REASON_LEN);
            match simdutf8::basic::from_utf8(&payload[2..end]) {
                Ok(reason) => Some(CloseInfo::new(code, reason)),
                Err(_) => Some(CloseInfo::new(
                    CloseCode::INVALID_PAYLOAD,
                    INVALID_UTF8_CLOSE_REASON,
                )),
            }
        }
    }
}

/// Build the payload answering a received close
///
/// Echoes the peer's code, or sends an empty payload when it sent none.
pub fn close_reply_payload(info: Option<&CloseInfo>) -> Bytes {
    match info {
        Some(info) => info.to_payload().freeze(),
        None => Bytes::new(),
    }
}
