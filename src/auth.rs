//! Challenge-Response Authentication
//!
//! Credentialed connections authenticate with two commands before the
//! first user request goes out:
//!
//! ```text
//! client                                  server
//!   │ ── { getnonce: 1 } ─────────────────▶ │
//!   │ ◀──────────────── { nonce: "…", ok } ─ │
//!   │ ── { authenticate: 1, user,           │
//!   │      nonce, key } ──────────────────▶ │
//!   │ ◀───────────────────────── { ok: 1 } ─ │
//! ```
//!
//! `key` is derived from the nonce and the stored credentials by
//! [`derive_key`]. The connection drives the exchange; this module only
//! builds the commands and judges the replies.

use crate::error::{Error, Result};
use crate::protocol::{command, reply::as_i64, Message, Reply};
use bson::doc;
use std::fmt;

/// Username/password pair used for authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Digest of the password as stored by the server.
pub fn password_digest(user: &str, password: &str) -> String {
    format!("{:x}", md5::compute(format!("{}:mongo:{}", user, password)))
}

/// Derives the authentication key: `md5(nonce + user + md5(user:mongo:password))`.
pub fn derive_key(nonce: &str, user: &str, password: &str) -> String {
    let digest = password_digest(user, password);
    format!("{:x}", md5::compute(format!("{}{}{}", nonce, user, digest)))
}

/// Builds the `getnonce` command against `<database>.$cmd`.
pub fn nonce_request(database: &str) -> Result<Message> {
    Ok(command(database, &doc! { "getnonce": 1 })?)
}

/// Builds the `authenticate` command for `nonce`.
pub fn authenticate_request(database: &str, credentials: &Credentials, nonce: &str) -> Result<Message> {
    let key = derive_key(nonce, &credentials.user, &credentials.password);
    Ok(command(
        database,
        &doc! {
            "authenticate": 1,
            "user": credentials.user.as_str(),
            "nonce": nonce,
            "key": key,
        },
    )?)
}

/// Extracts the nonce from a `getnonce` reply.
pub fn nonce_from(reply: &Reply) -> Result<String> {
    reply
        .first()
        .and_then(|doc| doc.get_str("nonce").ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Authentication("getnonce reply carried no nonce".to_string()))
}

/// Checks an `authenticate` reply: exactly one document with `ok: 1`.
pub fn check_authenticated(reply: &Reply) -> Result<()> {
    if reply.number_returned != 1 {
        return Err(Error::Authentication(format!(
            "expected one authenticate reply document, got {}",
            reply.number_returned
        )));
    }

    let Some(doc) = reply.first() else {
        return Err(Error::Authentication("empty authenticate reply".to_string()));
    };

    if doc.get("ok").and_then(as_i64) == Some(1) {
        return Ok(());
    }

    let message = doc
        .get_str("errmsg")
        .unwrap_or("authentication rejected")
        .to_string();
    Err(Error::Authentication(message))
}
