//! Per-connection state.
//!
//! A connection is always in exactly one [`Phase`]. Whatever a phase needs
//! (the caller's completion, the request being awaited, the request parked
//! behind authentication) lives inside that variant. Combinations such as
//! a deferred request without an authentication exchange cannot be built.

use crate::error::{Error, Result};
use crate::protocol::{Message, Reply};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type ReplySender = oneshot::Sender<Result<Reply>>;
pub(crate) type WriteSender = oneshot::Sender<Result<()>>;

/// How the caller wants to hear about a request.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Await the reply and deliver it
    Reply(ReplySender),
    /// No reply is requested; notify once the bytes are written
    Written(WriteSender),
}

impl Completion {
    pub(crate) fn fail(self, error: Error) {
        // A dropped receiver means the caller stopped waiting
        match self {
            Completion::Reply(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Written(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// A caller's request parked while authentication runs on its behalf.
#[derive(Debug)]
pub(crate) struct Deferred {
    pub(crate) message: Message,
    pub(crate) completion: Completion,
}

/// Which half of the reply is being waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStage {
    Header,
    Body { remaining: usize },
}

/// A request on the wire whose reply has not been fully read.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) request_id: i32,
    pub(crate) stage: ReadStage,
}

impl Exchange {
    pub(crate) fn new(request_id: i32) -> Self {
        Self {
            request_id,
            stage: ReadStage::Header,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthStep {
    NonceRequested,
    CredentialsSubmitted,
}

#[derive(Debug)]
pub(crate) enum Phase {
    /// No request outstanding
    Idle,
    /// An unacknowledged write is being flushed
    Writing { ack: WriteSender },
    /// A caller's request is on the wire
    InFlight {
        exchange: Exchange,
        completion: ReplySender,
    },
    /// An authentication sub-request is on the wire
    Authenticating {
        step: AuthStep,
        exchange: Exchange,
        deferred: Deferred,
    },
}

impl Phase {
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Phase::Idle)
    }

    pub(crate) fn exchange_mut(&mut self) -> Option<&mut Exchange> {
        match self {
            Phase::InFlight { exchange, .. } | Phase::Authenticating { exchange, .. } => {
                Some(exchange)
            }
            Phase::Idle | Phase::Writing { .. } => None,
        }
    }

    /// Fails whatever request this phase holds and returns to idle.
    /// Returns false if nothing was pending.
    pub(crate) fn fail(&mut self, error: Error) -> bool {
        match std::mem::replace(self, Phase::Idle) {
            Phase::Idle => false,
            Phase::Writing { ack } => {
                let _ = ack.send(Err(error));
                true
            }
            Phase::InFlight { completion, .. } => {
                let _ = completion.send(Err(error));
                true
            }
            Phase::Authenticating { deferred, .. } => {
                deferred.completion.fail(error);
                true
            }
        }
    }
}

/// Authentication progress for the current transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthStatus {
    NotRequired,
    Unauthenticated,
    Authenticated,
}

/// The single timer a connection may have armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Disarmed,
    Connect(Instant),
    Request(Instant),
}

impl Timer {
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self {
            Timer::Disarmed => None,
            Timer::Connect(at) | Timer::Request(at) => Some(*at),
        }
    }

    /// Arms the connect window, replacing any other timer.
    pub(crate) fn arm_connect(&mut self, window: Option<Duration>) {
        *self = window.map_or(Timer::Disarmed, |w| Timer::Connect(Instant::now() + w));
    }

    /// Arms the request window, replacing any other timer.
    pub(crate) fn arm_request(&mut self, window: Option<Duration>) {
        *self = window.map_or(Timer::Disarmed, |w| Timer::Request(Instant::now() + w));
    }

    pub(crate) fn disarm(&mut self) {
        *self = Timer::Disarmed;
    }
}
