//! Server and session configuration surfaces.
//!
//! All values are plain options read when a server starts or a session
//! connects; changing them afterwards has no effect on live sockets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options applied by the acceptor and inherited by every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Listen backlog of the acceptor socket
    pub acceptor_backlog: u32,
    /// Accept IPv4 clients on an IPv6 listener (only meaningful for IPv6 binds)
    pub dual_mode: bool,
    /// Enable SO_KEEPALIVE on accepted sockets
    pub keep_alive: bool,
    /// Idle seconds before keep-alive probes start; `None` keeps the OS default
    pub keep_alive_time: Option<u32>,
    /// Seconds between keep-alive probes; `None` keeps the OS default
    pub keep_alive_interval: Option<u32>,
    /// Unanswered probes before the connection drops; `None` keeps the OS default
    pub keep_alive_retry_count: Option<u32>,
    /// Disable Nagle's algorithm on accepted sockets
    pub no_delay: bool,
    /// Set SO_REUSEADDR on the acceptor socket (default on for unix, like tokio's `TcpListener::bind`)
    pub reuse_address: bool,
    /// Set SO_REUSEPORT on the acceptor socket (unix only)
    pub reuse_port: bool,
    /// Per-session buffer defaults
    pub session: SessionOptions,
    /// Disconnect the session when a write fails, after reporting the error
    pub disconnect_on_send_error: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            acceptor_backlog: 1024,
            dual_mode: false,
            keep_alive: false,
            keep_alive_time: None,
            keep_alive_interval: None,
            keep_alive_retry_count: None,
            no_delay: false,
            reuse_address: cfg!(unix),
            reuse_port: false,
            session: SessionOptions::default(),
            disconnect_on_send_error: true,
        }
    }
}

impl ServerOptions {
    /// Whether any keep-alive tuning value is set
    pub(crate) fn has_keep_alive_tuning(&self) -> bool {
        self.keep_alive_time.is_some()
            || self.keep_alive_interval.is_some()
            || self.keep_alive_retry_count.is_some()
    }

    pub(crate) fn keep_alive_time(&self) -> Option<Duration> {
        self.keep_alive_time.map(|secs| Duration::from_secs(secs.into()))
    }

    pub(crate) fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval
            .map(|secs| Duration::from_secs(secs.into()))
    }
}

/// Buffer sizing for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Initial receive buffer capacity in bytes
    pub receive_buffer_size: usize,
    /// Largest receive buffer capacity allowed; 0 = unlimited
    pub receive_buffer_limit: usize,
    /// Initial capacity of each send buffer in bytes
    pub send_buffer_size: usize,
    /// Largest number of queued, unsent bytes; 0 = unlimited
    pub send_buffer_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            receive_buffer_size: 8192,
            receive_buffer_limit: 0,
            send_buffer_size: 8192,
            send_buffer_limit: 0,
        }
    }
}
