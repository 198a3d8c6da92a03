//! Transport Backends
//!
//! A backend opens the byte stream a connection runs over. Backends are
//! picked by a configuration value ([`BackendKind`]) and used through the
//! [`Backend`] trait, so the connection never knows which one it has.
//!
//! - `tokio`: non-blocking connect on the runtime's reactor.
//! - `blocking`: connects with a blocking socket on the blocking thread pool,
//!   then hands the socket to the reactor. Useful where non-blocking connect
//!   misbehaves (some proxies, some container network stacks).
//!
//! Readiness, peer-close detection and timers all come from the tokio
//! runtime once the stream exists.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

/// A bidirectional byte stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// The transport handle owned by a connection.
pub type Transport = Box<dyn Stream>;

/// Opens transports to a server.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Opens a new stream to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Transport>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Non-blocking TCP connect on the tokio reactor.
#[derive(Debug, Clone, Copy)]
pub struct TokioBackend {
    pub nodelay: bool,
}

impl Default for TokioBackend {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[async_trait]
impl Backend for TokioBackend {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Transport> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(self.nodelay)?;
        trace!(host, port, backend = self.name(), "Transport opened");
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}

/// Blocking connect on the blocking pool, then registered with the reactor.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingBackend;

#[async_trait]
impl Backend for BlockingBackend {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Transport> {
        let target = (host.to_string(), port);
        let socket = tokio::task::spawn_blocking(move || std::net::TcpStream::connect(target))
            .await
            .map_err(io::Error::other)??;

        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;
        let stream = TcpStream::from_std(socket)?;
        trace!(host, port, backend = self.name(), "Transport opened");
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "blocking"
    }
}

/// Configuration selector for the transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Tokio,
    Blocking,
}

impl BackendKind {
    /// Instantiates the selected backend.
    pub fn build(self) -> Arc<dyn Backend> {
        match self {
            BackendKind::Tokio => Arc::new(TokioBackend::default()),
            BackendKind::Blocking => Arc::new(BlockingBackend),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Tokio => "tokio",
            BackendKind::Blocking => "blocking",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tokio" => Ok(BackendKind::Tokio),
            "blocking" => Ok(BackendKind::Blocking),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
