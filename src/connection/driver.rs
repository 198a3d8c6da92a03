//! Connection Driver
//!
//! Each connection is run by one driver task. The task owns the transport
//! and the connection's [`Phase`], and reacts to one event at a time:
//!
//! ```text
//!            ┌────────────────────────────────────────────┐
//!            │                select!                     │
//!            │  handle command │ socket read │ timer fires │
//!            └────────┬────────┴──────┬──────┴──────┬──────┘
//!                     ▼               ▼             ▼
//!                 on_send /       on_readable   on_timeout
//!                 close           (header, body)
//! ```
//!
//! ## Request flow
//!
//! ```text
//! Idle ──send──▶ [connect if needed]
//!                  │
//!                  ├─ auth pending ─▶ Authenticating(NonceRequested)
//!                  │                    │ nonce reply
//!                  │                    ▼
//!                  │                  Authenticating(CredentialsSubmitted)
//!                  │                    │ ok: 1
//!                  │                    ▼
//!                  └────────────────▶ InFlight ──reply──▶ Idle (re-cached)
//! ```
//!
//! Unacknowledged writes go `Idle → Writing → Idle` without reading.
//!
//! ## Closing
//!
//! Two close paths exist. The internal one (I/O error, protocol violation)
//! fails the pending request and drops the transport but leaves the
//! connection with whoever holds it. The public one (`close()`, timeout,
//! peer close) does the same and then hands the connection back to the
//! pool for a later reconnect.

use super::state::{AuthStatus, AuthStep, Completion, Deferred, Exchange, Phase, ReadStage, Timer};
use super::{Connection, Shared, Status};
use crate::auth;
use crate::backend::{Backend, Transport};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pool::ConnectionCache;
use crate::protocol::{decode_reply, DecodeError, Message, MessageHeader, ProtocolViolation, Reply, HEADER_LEN};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Read buffer growth step
const READ_CHUNK: usize = 4096;

/// Requests sent from a [`Connection`] handle to its driver.
#[derive(Debug)]
pub(crate) enum Command {
    Send {
        message: Message,
        completion: Completion,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Command(Command),
    Read(io::Result<usize>),
    Timeout,
    /// Every handle is gone; no more commands will arrive
    Detached,
}

enum WriteFailure {
    Io(io::Error),
    TimedOut,
}

pub(crate) struct Driver {
    id: u64,
    config: ConnectionConfig,
    backend: Arc<dyn Backend>,
    pool: Weak<dyn ConnectionCache>,
    database: String,
    shared: Weak<Shared>,
    status: Arc<Status>,
    transport: Option<Transport>,
    buffer: BytesMut,
    phase: Phase,
    timer: Timer,
    auth: AuthStatus,
}

impl Driver {
    pub(crate) fn new(
        id: u64,
        config: ConnectionConfig,
        backend: Arc<dyn Backend>,
        pool: &Arc<dyn ConnectionCache>,
        shared: Weak<Shared>,
        status: Arc<Status>,
    ) -> Self {
        let auth = if config.auth_required() {
            AuthStatus::Unauthenticated
        } else {
            AuthStatus::NotRequired
        };

        Self {
            id,
            config,
            backend,
            pool: Arc::downgrade(pool),
            database: pool.database_name().to_string(),
            shared,
            status,
            transport: None,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            phase: Phase::Idle,
            timer: Timer::Disarmed,
            auth,
        }
    }

    /// Runs until every handle is dropped and no request is outstanding.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut detached = false;

        loop {
            let deadline = self.timer.deadline();
            let event = tokio::select! {
                command = commands.recv(), if !detached => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Detached,
                },
                read = read_some(self.transport.as_mut(), &mut self.buffer) => Event::Read(read),
                () = expire(deadline) => Event::Timeout,
            };

            if matches!(event, Event::Detached) {
                detached = true;
            }

            self.dispatch(event).await;

            if detached && self.phase.is_idle() {
                break;
            }
        }

        debug!(connection = self.id, "Connection driver stopped");
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Command(Command::Send {
                message,
                completion,
            }) => self.on_send(message, completion).await,
            Event::Command(Command::Close { done }) => {
                self.close();
                let _ = done.send(());
            }
            Event::Read(Ok(0)) => self.on_transport_closed(),
            Event::Read(Ok(n)) => {
                trace!(connection = self.id, bytes = n, "Read data");
                self.on_readable().await;
            }
            Event::Read(Err(e)) => self.on_io_error(e),
            Event::Timeout => self.on_timeout(),
            Event::Detached => {}
        }
    }

    /// Opens a fresh transport, discarding any previous one.
    pub(crate) async fn connect(&mut self) -> Result<()> {
        self.set_usage_count(0);
        self.auth = if self.config.auth_required() {
            AuthStatus::Unauthenticated
        } else {
            AuthStatus::NotRequired
        };
        self.transport = None;
        self.buffer.clear();

        self.timer.arm_connect(self.config.connect_window());
        let attempt = self.backend.connect(&self.config.host, self.config.port);
        let result = match self.timer.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                }),
            None => attempt.await,
        };
        self.timer.disarm();

        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.status.alive.store(true, Ordering::Release);
                info!(
                    connection = self.id,
                    address = %self.config.address(),
                    backend = self.backend.name(),
                    "Connected"
                );
                Ok(())
            }
            Err(e) => {
                self.status.alive.store(false, Ordering::Release);
                warn!(
                    connection = self.id,
                    address = %self.config.address(),
                    error = %e,
                    "Connect failed"
                );
                Err(Error::Interface {
                    message: format!("failed to connect to {}: {}", self.config.address(), e),
                    source: Some(e),
                })
            }
        }
    }

    async fn on_send(&mut self, message: Message, completion: Completion) {
        if !self.phase.is_idle() {
            // The handle's busy flag keeps this from happening; the busy
            // flag belongs to the outstanding request, so leave it set.
            completion.fail(Error::Programming("connection already in use".to_string()));
            return;
        }

        if self.transport.is_none() {
            if !self.config.autoreconnect {
                self.release();
                completion.fail(Error::interface("connection invalid. autoreconnect=false"));
                return;
            }
            debug!(connection = self.id, "Reconnecting");
            if let Err(e) = self.connect().await {
                self.release();
                completion.fail(e);
                return;
            }
        }

        if self.auth == AuthStatus::Unauthenticated {
            self.request_nonce(Deferred {
                message,
                completion,
            })
            .await;
        } else {
            self.begin(message, completion).await;
        }
    }

    /// Records `completion` as pending and puts `message` on the wire.
    async fn begin(&mut self, message: Message, completion: Completion) {
        self.phase = match completion {
            Completion::Reply(tx) => Phase::InFlight {
                exchange: Exchange::new(message.request_id),
                completion: tx,
            },
            Completion::Written(ack) => Phase::Writing { ack },
        };
        self.transmit(&message).await;
    }

    async fn request_nonce(&mut self, deferred: Deferred) {
        let message = match auth::nonce_request(&self.database) {
            Ok(message) => message,
            Err(e) => return self.abort_auth(deferred, e),
        };

        debug!(connection = self.id, "Requesting authentication nonce");
        self.phase = Phase::Authenticating {
            step: AuthStep::NonceRequested,
            exchange: Exchange::new(message.request_id),
            deferred,
        };
        self.transmit(&message).await;
    }

    /// Writes `message` for the current phase. Unacknowledged writes finish
    /// here; everything else waits for the reply. The request window covers
    /// the write in both cases.
    async fn transmit(&mut self, message: &Message) {
        let usage = self.status.usage_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.timer.arm_request(self.config.request_timeout);

        trace!(
            connection = self.id,
            request_id = message.request_id,
            bytes = message.len(),
            usage,
            "Sending message"
        );

        match write_message(self.transport.as_mut(), message, self.timer.deadline()).await {
            Ok(()) => match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Writing { ack } => {
                    self.timer.disarm();
                    self.release();
                    let _ = ack.send(Ok(()));
                    self.recache();
                }
                other => self.phase = other,
            },
            Err(WriteFailure::Io(e)) => self.on_io_error(e),
            Err(WriteFailure::TimedOut) => self.on_timeout(),
        }
    }

    /// Consumes buffered bytes for the exchange in progress.
    async fn on_readable(&mut self) {
        loop {
            let Some(exchange) = self.phase.exchange_mut() else {
                if !self.buffer.is_empty() {
                    warn!(
                        connection = self.id,
                        bytes = self.buffer.len(),
                        "Discarding unsolicited data"
                    );
                    self.buffer.clear();
                }
                return;
            };

            match exchange.stage {
                ReadStage::Header => {
                    if self.buffer.len() < HEADER_LEN {
                        return;
                    }
                    let mut raw = [0u8; HEADER_LEN];
                    raw.copy_from_slice(&self.buffer[..HEADER_LEN]);
                    let header = MessageHeader::parse(&raw);

                    match header.validate_reply(exchange.request_id) {
                        Ok(remaining) => {
                            trace!(
                                connection = self.id,
                                request_id = exchange.request_id,
                                length = header.message_length,
                                "Parsed reply header"
                            );
                            exchange.stage = ReadStage::Body { remaining };
                            self.buffer.advance(HEADER_LEN);
                        }
                        Err(violation) => {
                            self.on_protocol_violation(violation);
                            return;
                        }
                    }
                }
                ReadStage::Body { remaining } => {
                    if self.buffer.len() < remaining {
                        self.buffer.reserve(remaining - self.buffer.len());
                        return;
                    }
                    let body = self.buffer.split_to(remaining).freeze();
                    self.on_body(body).await;
                }
            }
        }
    }

    async fn on_body(&mut self, body: Bytes) {
        self.timer.disarm();

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::InFlight {
                exchange,
                completion,
            } => {
                let outcome = classify(decode_reply(&body, exchange.request_id));
                if let Err(e) = &outcome {
                    debug!(connection = self.id, request_id = exchange.request_id, error = %e, "Request failed");
                }
                self.release();
                let _ = completion.send(outcome);
                self.recache();
            }
            Phase::Authenticating {
                step,
                exchange,
                deferred,
            } => {
                let decoded = decode_reply(&body, exchange.request_id).map_err(Error::from);
                match step {
                    AuthStep::NonceRequested => self.on_nonce_reply(decoded, deferred).await,
                    AuthStep::CredentialsSubmitted => self.on_auth_complete(decoded, deferred).await,
                }
            }
            other => self.phase = other,
        }
    }

    async fn on_nonce_reply(&mut self, decoded: Result<Reply>, deferred: Deferred) {
        let nonce = match decoded.and_then(|reply| auth::nonce_from(&reply)) {
            Ok(nonce) => nonce,
            Err(e) => return self.abort_auth(deferred, e),
        };

        let Some(credentials) = self.config.credentials.as_ref() else {
            return self.abort_auth(deferred, Error::Authentication("no credentials configured".into()));
        };

        let message = match auth::authenticate_request(&self.database, credentials, &nonce) {
            Ok(message) => message,
            Err(e) => return self.abort_auth(deferred, e),
        };

        debug!(connection = self.id, "Submitting credentials");
        self.phase = Phase::Authenticating {
            step: AuthStep::CredentialsSubmitted,
            exchange: Exchange::new(message.request_id),
            deferred,
        };
        self.transmit(&message).await;
    }

    async fn on_auth_complete(&mut self, decoded: Result<Reply>, deferred: Deferred) {
        if let Err(e) = decoded.and_then(|reply| auth::check_authenticated(&reply)) {
            return self.abort_auth(deferred, e);
        }

        self.auth = AuthStatus::Authenticated;
        info!(connection = self.id, database = %self.database, "Authenticated");

        let Deferred {
            message,
            completion,
        } = deferred;
        self.begin(message, completion).await;
    }

    /// Ends a failed handshake: the parked request receives the error and
    /// the connection, still alive but unauthenticated, goes back to the pool.
    fn abort_auth(&mut self, deferred: Deferred, error: Error) {
        let error = match error {
            Error::Authentication(_) => error,
            other => Error::Authentication(other.to_string()),
        };
        warn!(connection = self.id, error = %error, "Authentication failed");

        self.phase = Phase::Idle;
        self.release();
        deferred.completion.fail(error);
        self.recache();
    }

    fn on_timeout(&mut self) {
        warn!(connection = self.id, timer = ?self.timer, "Timed out");
        self.timer.disarm();
        self.close();
    }

    /// The peer closed the socket.
    fn on_transport_closed(&mut self) {
        info!(connection = self.id, "Server closed the connection");
        self.teardown();
        self.fail_pending(Error::connection_closed());
        self.recache();
    }

    fn on_io_error(&mut self, error: io::Error) {
        warn!(connection = self.id, error = %error, "Transport error");
        self.teardown();
        self.fail_pending(Error::from(error));
    }

    fn on_protocol_violation(&mut self, violation: ProtocolViolation) {
        warn!(connection = self.id, error = %violation, "Protocol violation");
        self.teardown();
        self.fail_pending(Error::Protocol(violation));
    }

    /// Public close: fail the pending request, drop the transport, and
    /// return the connection to the pool.
    fn close(&mut self) {
        self.close_internal();
        self.recache();
    }

    /// Internal close: fail the pending request and drop the transport.
    fn close_internal(&mut self) {
        if self.transport.is_some() {
            debug!(connection = self.id, "Closing connection");
        }
        self.teardown();
        self.fail_pending(Error::connection_closed());
    }

    fn teardown(&mut self) {
        self.transport = None;
        self.buffer.clear();
        self.timer.disarm();
        self.status.alive.store(false, Ordering::Release);
    }

    fn fail_pending(&mut self, error: Error) {
        if self.phase.fail(error) {
            self.release();
        }
    }

    fn release(&self) {
        self.status.busy.store(false, Ordering::Release);
    }

    fn set_usage_count(&self, count: u64) {
        self.status.usage_count.store(count, Ordering::Release);
    }

    /// Hands this connection back to the pool's idle set.
    fn recache(&self) {
        let (Some(pool), Some(shared)) = (self.pool.upgrade(), self.shared.upgrade()) else {
            return;
        };
        pool.cache(Connection::from_shared(shared));
    }
}

/// Turns a decoded reply into the caller's outcome.
fn classify(decoded: std::result::Result<Reply, DecodeError>) -> Result<Reply> {
    let reply = decoded?;
    if let Some((message, code)) = reply.server_error() {
        return Err(Error::Integrity {
            message,
            code,
            reply: Box::new(reply),
        });
    }
    Ok(reply)
}

async fn read_some(transport: Option<&mut Transport>, buf: &mut BytesMut) -> io::Result<usize> {
    match transport {
        Some(stream) => {
            buf.reserve(READ_CHUNK);
            stream.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn write_message(
    transport: Option<&mut Transport>,
    message: &Message,
    deadline: Option<Instant>,
) -> std::result::Result<(), WriteFailure> {
    let Some(stream) = transport else {
        return Err(WriteFailure::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "no transport",
        )));
    };

    let write = async {
        stream.write_all(&message.bytes).await?;
        stream.flush().await
    };

    let result = match deadline {
        Some(at) => tokio::time::timeout_at(at, write)
            .await
            .map_err(|_| WriteFailure::TimedOut)?,
        None => write.await,
    };
    result.map_err(WriteFailure::Io)
}
