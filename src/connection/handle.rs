//! The caller-facing connection handle.

use super::driver::{Command, Driver};
use super::state::Completion;
use crate::backend::Backend;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pool::ConnectionCache;
use crate::protocol::{Message, Reply};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Flags read by handles and written by the driver
#[derive(Debug, Default)]
pub(crate) struct Status {
    /// A request is outstanding
    pub(crate) busy: AtomicBool,
    /// The transport is open
    pub(crate) alive: AtomicBool,
    pub(crate) usage_count: AtomicU64,
}

pub(crate) struct Shared {
    id: u64,
    config: ConnectionConfig,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<Status>,
}

/// A single server connection.
///
/// `Connection` is a cheap handle: clones refer to the same connection, and
/// equality is identity. The socket itself is owned by a background task
/// that lives as long as any handle does.
///
/// At most one request may be outstanding. A second
/// [`send_message`](Connection::send_message) before the first completes is
/// rejected with [`Error::Programming`].
///
/// ## Example
///
/// ```ignore
/// use docwire::{Connection, ConnectionConfig, IdlePool};
/// use docwire::protocol::command;
/// use bson::doc;
/// use std::sync::Arc;
///
/// let pool = Arc::new(IdlePool::new("admin"));
/// let conn = Connection::connect(ConnectionConfig::default(), pool.clone()).await?;
///
/// let reply = conn.send_message(command("admin", &doc! { "ping": 1 })?)?.await?;
/// println!("{:?}", reply.first());
/// ```
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Opens a connection using the backend named in `config`.
    ///
    /// The connection reports itself idle to `pool` whenever a request
    /// finishes, and authenticates against `pool`'s database when
    /// credentials are configured.
    pub async fn connect(config: ConnectionConfig, pool: Arc<dyn ConnectionCache>) -> Result<Self> {
        let backend = config.backend.build();
        Self::connect_with_backend(config, backend, pool).await
    }

    /// Opens a connection over an explicit backend.
    pub async fn connect_with_backend(
        config: ConnectionConfig,
        backend: Arc<dyn Backend>,
        pool: Arc<dyn ConnectionCache>,
    ) -> Result<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::unbounded_channel();
        let status = Arc::new(Status::default());

        let shared = Arc::new(Shared {
            id,
            config: config.clone(),
            commands,
            status: status.clone(),
        });

        let mut driver = Driver::new(id, config, backend, &pool, Arc::downgrade(&shared), status);
        driver.connect().await?;
        tokio::spawn(driver.run(receiver));

        debug!(connection = id, "Connection ready");
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Sends a request and returns a future resolving to its reply.
    ///
    /// Fails immediately, before any I/O, if another request is outstanding
    /// or if the connection is closed and autoreconnect is disabled. All
    /// other failures arrive through the returned [`Pending`].
    pub fn send_message(&self, message: Message) -> Result<Pending<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.submit(message, Completion::Reply(tx))?;
        Ok(Pending { rx })
    }

    /// Sends a request that has no reply.
    ///
    /// The returned future resolves once the bytes are written, and the
    /// connection is returned to its pool at that point.
    pub fn send_unacknowledged(&self, message: Message) -> Result<Pending<()>> {
        let (tx, rx) = oneshot::channel();
        self.submit(message, Completion::Written(tx))?;
        Ok(Pending { rx })
    }

    fn submit(&self, message: Message, completion: Completion) -> Result<()> {
        let status = &self.shared.status;
        if status
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Programming("connection already in use".to_string()));
        }

        if !self.is_alive() && !self.shared.config.autoreconnect {
            status.busy.store(false, Ordering::Release);
            return Err(Error::interface("connection invalid. autoreconnect=false"));
        }

        let command = Command::Send {
            message,
            completion,
        };
        if self.shared.commands.send(command).is_err() {
            status.busy.store(false, Ordering::Release);
            return Err(Error::connection_closed());
        }
        Ok(())
    }

    /// Closes the transport and returns the connection to its pool.
    ///
    /// Any outstanding request fails with "connection closed". The
    /// connection reconnects on its next request if autoreconnect is on.
    pub async fn close(&self) {
        let (done, finished) = oneshot::channel();
        if self.shared.commands.send(Command::Close { done }).is_ok() {
            let _ = finished.await;
        }
    }

    /// Whether the transport is currently open.
    pub fn is_alive(&self) -> bool {
        self.shared.status.alive.load(Ordering::Acquire)
    }

    /// Whether a request is outstanding.
    pub fn is_busy(&self) -> bool {
        self.shared.status.busy.load(Ordering::Acquire)
    }

    /// Messages written since the last (re)connect, authentication included.
    pub fn usage_count(&self) -> u64 {
        self.shared.status.usage_count.load(Ordering::Acquire)
    }

    /// Process-unique identifier, as it appears in log events.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Server hostname.
    pub fn host(&self) -> &str {
        &self.shared.config.host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.shared.config.port
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("address", &self.shared.config.address())
            .field("alive", &self.is_alive())
            .field("busy", &self.is_busy())
            .field("usage_count", &self.usage_count())
            .finish()
    }
}

/// The outcome of a request, resolved by the connection's driver.
#[must_use = "the request outcome is only observed by awaiting it"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(Error::connection_closed())))
    }
}
