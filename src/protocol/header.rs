//! Wire Message Header
//!
//! Every message on the wire, in both directions, starts with the same
//! fixed 16-byte header made of four little-endian `i32` fields:
//!
//! ```text
//! ┌───────────────┬───────────────┬───────────────┬───────────────┐
//! │ messageLength │   requestID   │  responseTo   │    opCode     │
//! │   bytes 0-3   │   bytes 4-7   │   bytes 8-11  │  bytes 12-15  │
//! └───────────────┴───────────────┴───────────────┴───────────────┘
//! ```
//!
//! `messageLength` includes the header itself. On a reply, `responseTo`
//! echoes the `requestID` of the request it answers.

use thiserror::Error;

/// Size of the fixed message header in bytes
pub const HEADER_LEN: usize = 16;

/// Upper bound accepted for a single reply (48 MiB, the server's own cap)
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Operation codes used by this driver
pub mod opcode {
    pub const REPLY: i32 = 1;
    pub const UPDATE: i32 = 2001;
    pub const INSERT: i32 = 2002;
    pub const QUERY: i32 = 2004;
    pub const DELETE: i32 = 2006;
}

/// A reply header that does not match the request it should answer.
///
/// These indicate a bug or a misbehaving peer. The stream position can no
/// longer be trusted, so the connection is torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `responseTo` does not echo the in-flight request id
    #[error("reply correlator mismatch: expected {expected}, got {actual}")]
    CorrelatorMismatch { expected: i32, actual: i32 },

    /// Anything other than OP_REPLY came back
    #[error("unexpected opcode {0} (expected OP_REPLY)")]
    UnexpectedOpCode(i32),

    /// Declared length is shorter than the header or over the size cap
    #[error("invalid message length: {0}")]
    InvalidLength(i32),
}

/// The decoded 16-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    /// Creates a request header for a payload of `body_len` bytes.
    pub fn request(request_id: i32, op_code: i32, body_len: usize) -> Self {
        Self {
            message_length: (HEADER_LEN + body_len) as i32,
            request_id,
            response_to: 0,
            op_code,
        }
    }

    /// Decodes a header from exactly [`HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        let field = |at: usize| i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Self {
            message_length: field(0),
            request_id: field(4),
            response_to: field(8),
            op_code: field(12),
        }
    }

    /// Appends the wire form of this header to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.to_le_bytes());
    }

    /// Checks that this header is the reply to `expected_request_id` and
    /// returns the number of body bytes that follow it.
    pub fn validate_reply(&self, expected_request_id: i32) -> Result<usize, ProtocolViolation> {
        if self.response_to != expected_request_id {
            return Err(ProtocolViolation::CorrelatorMismatch {
                expected: expected_request_id,
                actual: self.response_to,
            });
        }

        if self.op_code != opcode::REPLY {
            return Err(ProtocolViolation::UnexpectedOpCode(self.op_code));
        }

        let length = usize::try_from(self.message_length)
            .map_err(|_| ProtocolViolation::InvalidLength(self.message_length))?;
        if !(HEADER_LEN..=MAX_MESSAGE_SIZE).contains(&length) {
            return Err(ProtocolViolation::InvalidLength(self.message_length));
        }

        Ok(length - HEADER_LEN)
    }
}
