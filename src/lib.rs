//! # docwire - A Connection-Level Driver for a Document Database
//!
//! docwire speaks the legacy document database wire protocol over TCP: one
//! [`Connection`] per socket, one request at a time, with the
//! challenge-response login performed transparently before the first
//! request on every fresh transport.
//!
//! ## Features
//!
//! - **Wire framing**: 16-byte little-endian headers, OP_QUERY and the
//!   unacknowledged write opcodes out, OP_REPLY in
//! - **Authentication**: `getnonce`/`authenticate` handshake that parks the
//!   caller's request and replays it once the login succeeds
//! - **Timeouts**: a single connect-or-request deadline per connection
//! - **Autoreconnect**: a closed connection reopens on its next request
//! - **Pool hand-off**: finished connections report themselves idle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               docwire                               │
//! │                                                                     │
//! │  ┌─────────────┐  commands   ┌──────────────────────────────────┐   │
//! │  │ Connection  │────────────>│             Driver               │   │
//! │  │  (handle)   │<────────────│  Phase / Timer / AuthStatus      │   │
//! │  └─────────────┘   replies   └───────┬──────────────────┬───────┘   │
//! │                                      │                  │           │
//! │                                      ▼                  ▼           │
//! │  ┌─────────────┐             ┌─────────────┐    ┌───────────────┐   │
//! │  │  protocol   │<────────────│   Backend   │    │ConnectionCache│   │
//! │  │ header/msg/ │  encode /   │ tokio or    │    │   (IdlePool)  │   │
//! │  │   reply     │  decode     │ blocking    │    └───────────────┘   │
//! │  └─────────────┘             └─────────────┘                        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use docwire::{Connection, ConnectionConfig, IdlePool};
//! use docwire::protocol::command;
//! use bson::doc;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> docwire::Result<()> {
//!     let pool = Arc::new(IdlePool::new("admin"));
//!     let config = ConnectionConfig::new()
//!         .host("127.0.0.1")
//!         .credentials("admin", "secret");
//!
//!     let conn = Connection::connect(config, pool.clone()).await?;
//!     let reply = conn.send_message(command("admin", &doc! { "ping": 1 })?)?.await?;
//!     println!("{:?}", reply.first());
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Header, request encoders and reply decoder
//! - [`auth`]: Credentials, key derivation and handshake commands
//! - [`connection`]: The connection handle and its driver task
//! - [`backend`]: Pluggable transport backends
//! - [`pool`]: The idle-cache interface a connection reports to
//! - [`config`]: Connection configuration
//! - [`error`]: Error types
//!
//! ## Error Delivery
//!
//! Misuse (a second request on a busy connection, or a request on a closed
//! connection with autoreconnect off) fails synchronously from
//! [`Connection::send_message`]. Everything else is delivered through the
//! request's [`Pending`] future, which always resolves.

pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;

// Re-export commonly used types for convenience
pub use auth::Credentials;
pub use backend::{Backend, BackendKind};
pub use config::{ConnectionConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use connection::{Connection, Pending};
pub use error::{Error, Result};
pub use pool::{ConnectionCache, IdlePool};
pub use protocol::{Message, Reply};

/// Version of docwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
