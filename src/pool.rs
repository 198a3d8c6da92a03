//! Idle Connection Cache
//!
//! A connection reports "I am idle" by handing itself to its pool through
//! [`ConnectionCache::cache`]. That call is the only interaction a
//! connection has with pool membership. How connections are created,
//! chosen or grown is the pool's business.
//!
//! [`IdlePool`] is the minimal cache: a FIFO of idle connections keyed by
//! identity, so a connection reported idle twice is only stored once.

use crate::connection::Connection;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;

/// The pool-side interface a connection consumes.
pub trait ConnectionCache: Send + Sync {
    /// Returns `connection` to the idle set.
    fn cache(&self, connection: Connection);

    /// Database whose `$cmd` namespace carries authentication commands.
    fn database_name(&self) -> &str;
}

/// A FIFO idle set.
#[derive(Debug)]
pub struct IdlePool {
    database: String,
    idle: Mutex<VecDeque<Connection>>,
}

impl IdlePool {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Takes the longest-idle connection out of the set.
    pub fn checkout(&self) -> Option<Connection> {
        let connection = self.lock().pop_front();
        if let Some(conn) = &connection {
            trace!(connection = conn.id(), "Connection checked out");
        }
        connection
    }

    /// Number of idle connections.
    pub fn idle_len(&self) -> usize {
        self.lock().len()
    }

    /// Whether `connection` is currently in the idle set.
    pub fn contains(&self, connection: &Connection) -> bool {
        self.lock().iter().any(|c| c == connection)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Connection>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConnectionCache for IdlePool {
    fn cache(&self, connection: Connection) {
        let mut idle = self.lock();
        if idle.iter().any(|c| *c == connection) {
            return;
        }
        trace!(
            connection = connection.id(),
            idle = idle.len() + 1,
            "Connection cached"
        );
        idle.push_back(connection);
    }

    fn database_name(&self) -> &str {
        &self.database
    }
}
