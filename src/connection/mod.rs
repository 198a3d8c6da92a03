//! Connection Module
//!
//! A [`Connection`] carries one request at a time to a server and hands
//! itself back to its pool when the request is done.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Command::Send / Close   ┌──────────────────────────┐
//! │  Connection  │ ────────────────────────> │         Driver           │
//! │   (handle)   │                           │  (one tokio task)        │
//! │              │ <──────── oneshot ─────── │                          │
//! │ busy / alive │                           │  transport, read buffer  │
//! │ usage_count  │ <──── shared atomics ──── │  Phase, Timer, AuthStatus│
//! └──────────────┘                           └────────────┬─────────────┘
//!                                                         │ cache(conn)
//!                                                         ▼
//!                                                ┌─────────────────┐
//!                                                │ ConnectionCache │
//!                                                └─────────────────┘
//! ```
//!
//! The handle performs the checks that must fail synchronously (busy,
//! autoreconnect disabled). Everything that touches the socket happens in
//! the driver.

mod driver;
mod handle;
mod state;

#[cfg(test)]
mod tests;

pub use handle::{Connection, Pending};

pub(crate) use handle::{Shared, Status};
