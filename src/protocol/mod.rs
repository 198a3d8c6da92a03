//! Wire Protocol Implementation
//!
//! This module frames requests and replies for the legacy document database
//! wire protocol (OP_QUERY / OP_REPLY and the unacknowledged write opcodes).
//!
//! ## Modules
//!
//! - `header`: The fixed 16-byte message header and reply validation
//! - `message`: Encoders for outbound requests
//! - `reply`: Decoder for OP_REPLY bodies
//!
//! ## Example
//!
//! ```ignore
//! use docwire::protocol::{encode_query, decode_reply, MessageHeader};
//! use bson::doc;
//!
//! // Encoding a command
//! let message = encode_query(1, "admin.$cmd", 0, 0, 1, &doc! { "ping": 1 }, None)?;
//!
//! // Decoding the reply once the header has been read
//! let header = MessageHeader::parse(&header_bytes);
//! let body_len = header.validate_reply(message.request_id)?;
//! let reply = decode_reply(&body, message.request_id)?;
//! ```

pub mod header;
pub mod message;
pub mod reply;

// Re-export commonly used types for convenience
pub use header::{opcode, MessageHeader, ProtocolViolation, HEADER_LEN, MAX_MESSAGE_SIZE};
pub use message::{
    command, command_namespace, encode_query, next_request_id, query, EncodeError, Message,
};
pub use reply::{decode_reply, DecodeError, Reply};
