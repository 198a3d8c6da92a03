//! Outbound Message Encoding
//!
//! Builds the bytes for request messages. Every encoder returns a
//! [`Message`], which pairs the encoded buffer with the request id embedded
//! in it so the connection can correlate the reply.
//!
//! ## Layouts
//!
//! ```text
//! OP_QUERY  (2004): flags i32 | namespace cstring | skip i32 | limit i32 | query doc | [fields doc]
//! OP_INSERT (2002): flags i32 | namespace cstring | doc*
//! OP_UPDATE (2001): 0 i32     | namespace cstring | flags i32 | selector doc | update doc
//! OP_DELETE (2006): 0 i32     | namespace cstring | flags i32 | selector doc
//! ```
//!
//! Writes have no reply of their own. Passing `last_error` args appends a
//! `getlasterror` query to the same buffer. The message then takes that
//! query's request id, and the server answers it once the write is applied.

use crate::protocol::header::{opcode, MessageHeader};
use bson::{doc, Document};
use bytes::Bytes;
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

/// Namespace used for the `getlasterror` acknowledgement query
pub const ADMIN_COMMAND_NAMESPACE: &str = "admin.$cmd";

/// OP_QUERY flag bits
pub mod query_flags {
    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;
}

/// OP_UPDATE flag bits
pub mod update_flags {
    pub const UPSERT: i32 = 1;
    pub const MULTI_UPDATE: i32 = 1 << 1;
}

/// OP_DELETE flag bits
pub mod delete_flags {
    pub const SINGLE_REMOVE: i32 = 1;
}

/// OP_INSERT flag bits
pub mod insert_flags {
    pub const CONTINUE_ON_ERROR: i32 = 1;
}

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a fresh request id. Ids wrap around and never equal zero, which
/// servers use for unsolicited messages.
pub fn next_request_id() -> i32 {
    loop {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Errors that can occur while encoding a request.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Namespaces are written as C strings
    #[error("namespace contains a NUL byte: {0:?}")]
    InvalidNamespace(String),

    /// The document could not be serialized
    #[error("failed to encode document: {0}")]
    Document(#[from] bson::ser::Error),

    /// No documents were given to an insert
    #[error("insert requires at least one document")]
    EmptyInsert,
}

/// An encoded request ready to be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The correlator the reply must echo
    pub request_id: i32,
    /// The complete wire bytes, headers included
    pub bytes: Bytes,
}

impl Message {
    /// Wraps pre-encoded bytes. `request_id` must be the id of the last
    /// message in `bytes`, the one whose reply is awaited.
    pub fn new(request_id: i32, bytes: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Builds a `<database>.$cmd` namespace.
pub fn command_namespace(database: &str) -> String {
    format!("{}.$cmd", database)
}

/// Encodes an OP_QUERY message with the given request id.
pub fn encode_query(
    request_id: i32,
    namespace: &str,
    flags: i32,
    skip: i32,
    limit: i32,
    query: &Document,
    fields: Option<&Document>,
) -> Result<Message, EncodeError> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&flags.to_le_bytes());
    write_cstring(&mut body, namespace)?;
    body.extend_from_slice(&skip.to_le_bytes());
    body.extend_from_slice(&limit.to_le_bytes());
    query.to_writer(&mut body)?;
    if let Some(fields) = fields {
        fields.to_writer(&mut body)?;
    }

    Ok(frame(request_id, opcode::QUERY, &body))
}

/// Encodes an OP_QUERY message with a freshly allocated request id.
pub fn query(
    namespace: &str,
    flags: i32,
    skip: i32,
    limit: i32,
    query: &Document,
    fields: Option<&Document>,
) -> Result<Message, EncodeError> {
    encode_query(next_request_id(), namespace, flags, skip, limit, query, fields)
}

/// Encodes a single-document command against `<database>.$cmd`.
pub fn command(database: &str, command: &Document) -> Result<Message, EncodeError> {
    query(
        &command_namespace(database),
        0,
        0,
        1,
        command,
        Some(&Document::new()),
    )
}

/// Encodes an OP_INSERT of `documents`.
pub fn insert(
    namespace: &str,
    documents: &[Document],
    flags: i32,
    last_error: Option<&Document>,
) -> Result<Message, EncodeError> {
    if documents.is_empty() {
        return Err(EncodeError::EmptyInsert);
    }

    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&flags.to_le_bytes());
    write_cstring(&mut body, namespace)?;
    for document in documents {
        document.to_writer(&mut body)?;
    }

    finish_write(opcode::INSERT, &body, last_error)
}

/// Encodes an OP_UPDATE applying `update` to documents matching `selector`.
pub fn update(
    namespace: &str,
    selector: &Document,
    update: &Document,
    flags: i32,
    last_error: Option<&Document>,
) -> Result<Message, EncodeError> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&0i32.to_le_bytes());
    write_cstring(&mut body, namespace)?;
    body.extend_from_slice(&flags.to_le_bytes());
    selector.to_writer(&mut body)?;
    update.to_writer(&mut body)?;

    finish_write(opcode::UPDATE, &body, last_error)
}

/// Encodes an OP_DELETE of documents matching `selector`.
pub fn delete(
    namespace: &str,
    selector: &Document,
    flags: i32,
    last_error: Option<&Document>,
) -> Result<Message, EncodeError> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&0i32.to_le_bytes());
    write_cstring(&mut body, namespace)?;
    body.extend_from_slice(&flags.to_le_bytes());
    selector.to_writer(&mut body)?;

    finish_write(opcode::DELETE, &body, last_error)
}

/// Frames a write and, when `last_error` is given, appends the
/// acknowledgement query that the reply will answer.
fn finish_write(
    op_code: i32,
    body: &[u8],
    last_error: Option<&Document>,
) -> Result<Message, EncodeError> {
    let write = frame(next_request_id(), op_code, body);
    let Some(args) = last_error else {
        return Ok(write);
    };

    let mut cmd = doc! { "getlasterror": 1 };
    for (key, value) in args {
        cmd.insert(key.clone(), value.clone());
    }
    let ack = query(ADMIN_COMMAND_NAMESPACE, 0, 0, -1, &cmd, None)?;

    let mut bytes = Vec::with_capacity(write.len() + ack.len());
    bytes.extend_from_slice(&write.bytes);
    bytes.extend_from_slice(&ack.bytes);
    Ok(Message::new(ack.request_id, bytes))
}

fn frame(request_id: i32, op_code: i32, body: &[u8]) -> Message {
    let mut bytes = Vec::with_capacity(16 + body.len());
    MessageHeader::request(request_id, op_code, body.len()).write_to(&mut bytes);
    bytes.extend_from_slice(body);
    Message::new(request_id, bytes)
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    if s.as_bytes().contains(&0) {
        return Err(EncodeError::InvalidNamespace(s.to_string()));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}
