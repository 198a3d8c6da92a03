//! OP_REPLY Decoding
//!
//! The body that follows a reply header is laid out as:
//!
//! ```text
//! responseFlags i32 | cursorID i64 | startingFrom i32 | numberReturned i32 | doc*
//! ```
//!
//! Decoding checks the response flags before touching the documents. A
//! dead cursor or a failed query is reported as a [`DecodeError`] rather
//! than a reply.

use bson::{Bson, Document};
use thiserror::Error;

/// Size of the fixed OP_REPLY prefix before the documents
pub const REPLY_PREFIX_LEN: usize = 20;

/// OP_REPLY response flag bits
pub mod response_flags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

/// Errors that can occur while decoding a reply body.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes than the fixed reply prefix
    #[error("reply body too short: {0} bytes")]
    Truncated(usize),

    /// A document length prefix points outside the body
    #[error("invalid document length {length} at offset {offset}")]
    InvalidDocumentLength { offset: usize, length: i32 },

    /// The document bytes are not a valid document
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// `numberReturned` disagrees with the documents present
    #[error("reply declared {declared} documents but contained {actual}")]
    CountMismatch { declared: i32, actual: usize },

    /// The server no longer knows the cursor the request referred to
    #[error("cursor not valid at server (request {request_id})")]
    CursorNotFound { request_id: i32 },

    /// The query failed; the server's `$err` message is carried along
    #[error("database error: {0}")]
    QueryFailure(String),
}

/// A decoded OP_REPLY.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// The first returned document, which carries the result of a command.
    pub fn first(&self) -> Option<&Document> {
        self.documents.first()
    }

    /// Returns the server-reported `(err, code)` pair when the first
    /// document carries both a non-empty `err` and a non-zero `code`. The
    /// code may be any numeric type or a numeric string; anything else is
    /// not a server error.
    pub fn server_error(&self) -> Option<(String, i64)> {
        let first = self.first()?;
        let err = first.get("err").filter(|v| is_truthy(v))?;
        let code = first.get("code").filter(|v| is_truthy(v))?;

        let message = match err {
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        };
        let code = match code {
            Bson::String(s) => s.trim().parse().ok()?,
            other => as_i64(other)?,
        };
        Some((message, code))
    }

    /// Encodes this reply as an OP_REPLY body (without the header).
    pub fn encode_body(&self) -> Result<Vec<u8>, bson::ser::Error> {
        let mut buf = Vec::with_capacity(REPLY_PREFIX_LEN + 64);
        buf.extend_from_slice(&self.response_flags.to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        buf.extend_from_slice(&self.starting_from.to_le_bytes());
        buf.extend_from_slice(&self.number_returned.to_le_bytes());
        for doc in &self.documents {
            doc.to_writer(&mut buf)?;
        }
        Ok(buf)
    }

    /// Builds a reply carrying `documents` with no flags set.
    pub fn with_documents(documents: Vec<Document>) -> Self {
        Self {
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: documents.len() as i32,
            documents,
        }
    }
}

/// Decodes an OP_REPLY body. `request_id` identifies the request being
/// answered and is only used to describe a dead cursor.
pub fn decode_reply(body: &[u8], request_id: i32) -> Result<Reply, DecodeError> {
    if body.len() < REPLY_PREFIX_LEN {
        return Err(DecodeError::Truncated(body.len()));
    }

    let response_flags = read_i32(body, 0);
    let cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap_or_default());
    let starting_from = read_i32(body, 12);
    let number_returned = read_i32(body, 16);
    let payload = &body[REPLY_PREFIX_LEN..];

    if response_flags & response_flags::CURSOR_NOT_FOUND != 0 {
        return Err(DecodeError::CursorNotFound { request_id });
    }

    let documents = decode_documents(payload, REPLY_PREFIX_LEN)?;

    if response_flags & response_flags::QUERY_FAILURE != 0 {
        let message = documents
            .first()
            .and_then(|doc| doc.get_str("$err").ok())
            .unwrap_or("unknown query failure")
            .to_string();
        return Err(DecodeError::QueryFailure(message));
    }

    if usize::try_from(number_returned).ok() != Some(documents.len()) {
        return Err(DecodeError::CountMismatch {
            declared: number_returned,
            actual: documents.len(),
        });
    }

    Ok(Reply {
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}

/// Splits a run of length-prefixed documents. `base` is the offset of
/// `buf` within the reply body, for error reporting.
fn decode_documents(mut buf: &[u8], base: usize) -> Result<Vec<Document>, DecodeError> {
    let mut documents = Vec::new();
    let mut offset = base;

    while !buf.is_empty() {
        if buf.len() < 4 {
            return Err(DecodeError::Truncated(offset + buf.len()));
        }
        let length = read_i32(buf, 0);
        // The smallest document is 5 bytes: the length and a terminating NUL
        let size = usize::try_from(length)
            .ok()
            .filter(|&n| n >= 5 && n <= buf.len())
            .ok_or(DecodeError::InvalidDocumentLength { offset, length })?;

        let (raw, rest) = buf.split_at(size);
        let mut reader = raw;
        let doc = Document::from_reader(&mut reader)
            .map_err(|e| DecodeError::InvalidDocument(e.to_string()))?;
        documents.push(doc);

        buf = rest;
        offset += size;
    }

    Ok(documents)
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Numeric view of a status field, accepting every numeric encoding a
/// server may choose.
pub fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        Bson::Boolean(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        Bson::String(s) => !s.is_empty(),
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        _ => true,
    }
}
