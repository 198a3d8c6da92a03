//! Connection configuration.
//!
//! Holds the target address, timeouts, credentials and transport selection
//! for a single connection.

use crate::auth::Credentials;
use crate::backend::BackendKind;
use std::time::Duration;

/// Default server port
pub const DEFAULT_PORT: u16 = 27017;

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default connect and request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 27017)
    pub port: u16,
    /// Bound on establishing the transport; `None` disables it
    pub connect_timeout: Option<Duration>,
    /// Bound on each request's reply; `None` disables it
    pub request_timeout: Option<Duration>,
    /// Credentials; when set, every fresh transport authenticates first
    pub credentials: Option<Credentials>,
    /// Reconnect transparently when a request finds the transport gone
    pub autoreconnect: bool,
    /// Transport backend
    pub backend: BackendKind,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Some(DEFAULT_TIMEOUT),
            request_timeout: Some(DEFAULT_TIMEOUT),
            credentials: None,
            autoreconnect: true,
            backend: BackendKind::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the credentials.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(user, password));
        self
    }

    /// Enable or disable autoreconnect.
    pub fn autoreconnect(mut self, enabled: bool) -> Self {
        self.autoreconnect = enabled;
        self
    }

    /// Set the transport backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Whether every fresh transport must authenticate before use.
    pub fn auth_required(&self) -> bool {
        self.credentials.is_some()
    }

    /// The window armed while connecting: the smaller of the two timeouts.
    pub fn connect_window(&self) -> Option<Duration> {
        match (self.connect_timeout, self.request_timeout) {
            (Some(c), Some(r)) => Some(c.min(r)),
            (Some(t), None) | (None, Some(t)) => Some(t),
            (None, None) => None,
        }
    }

    /// Returns the target address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
