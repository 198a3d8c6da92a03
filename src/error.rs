//! Driver Error Types
//!
//! Every failure a connection can report maps onto one variant of [`Error`]:
//!
//! | Variant          | Raised when                                                  |
//! |------------------|--------------------------------------------------------------|
//! | `Programming`    | a request is issued on a connection that is already busy     |
//! | `Interface`      | the transport fails, closes, times out or cannot reconnect   |
//! | `Authentication` | the nonce fetch or the credential check fails                |
//! | `Integrity`      | the server reports `{err, code}` in an otherwise valid reply |
//! | `Decode`         | the reply body cannot be parsed                              |
//! | `Protocol`       | the reply header does not answer the in-flight request       |
//!
//! Only `Programming` (and `Interface` when autoreconnect is off) is raised
//! directly by `send_message`. Everything else arrives as the outcome of the
//! request itself.

use crate::protocol::{DecodeError, EncodeError, ProtocolViolation, Reply};
use thiserror::Error;

/// Message delivered when the transport goes away under a request
pub const CONNECTION_CLOSED: &str = "connection closed";

/// Errors returned by the driver.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller misuse, such as issuing a request on a busy connection
    #[error("programming error: {0}")]
    Programming(String),

    /// Transport-level failure
    #[error("interface error: {message}")]
    Interface {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The authentication handshake failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server reported a failure alongside a well-formed reply
    #[error("integrity error: {message} (code {code})")]
    Integrity {
        message: String,
        code: i64,
        reply: Box<Reply>,
    },

    /// The reply body could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The reply header violated the protocol
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A request could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

impl Error {
    pub fn interface(message: impl Into<String>) -> Self {
        Error::Interface {
            message: message.into(),
            source: None,
        }
    }

    /// The error every pending request receives when its transport closes.
    pub fn connection_closed() -> Self {
        Self::interface(CONNECTION_CLOSED)
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, Error::Interface { .. })
    }

    pub fn is_programming(&self) -> bool {
        matches!(self, Error::Programming(_))
    }

    /// The reply that came with an `Integrity` error, if any.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Error::Integrity { reply, .. } => Some(reply),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Interface {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
