//! Error types and transport error classification.

use std::fmt;
use std::io;
use thiserror::Error;

/// Classified transport error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Connection aborted locally
    ConnectionAborted,
    /// Connection refused by the peer
    ConnectionRefused,
    /// Connection reset by the peer
    ConnectionReset,
    /// Operation aborted because the transport was torn down
    OperationAborted,
    /// Transport already shut down (broken pipe)
    Shutdown,
    /// Backpressure limit exceeded
    NoBufferSpace,
    /// Transport not connected, or the TLS handshake failed
    NotConnected,
    /// Any other I/O failure
    Io(io::ErrorKind),
}

impl ErrorCode {
    /// Whether this code is the normal signature of a peer- or teardown-initiated
    /// close. Such errors are swallowed instead of being reported.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionAborted
                | ErrorCode::ConnectionRefused
                | ErrorCode::ConnectionReset
                | ErrorCode::OperationAborted
                | ErrorCode::Shutdown
        )
    }
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
            io::ErrorKind::BrokenPipe => ErrorCode::Shutdown,
            // rustls reports a peer that vanished without close_notify this way
            io::ErrorKind::UnexpectedEof => ErrorCode::ConnectionReset,
            io::ErrorKind::NotConnected => ErrorCode::NotConnected,
            kind => ErrorCode::Io(kind),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ConnectionAborted => write!(f, "connection aborted"),
            ErrorCode::ConnectionRefused => write!(f, "connection refused"),
            ErrorCode::ConnectionReset => write!(f, "connection reset"),
            ErrorCode::OperationAborted => write!(f, "operation aborted"),
            ErrorCode::Shutdown => write!(f, "transport shut down"),
            ErrorCode::NoBufferSpace => write!(f, "no buffer space available"),
            ErrorCode::NotConnected => write!(f, "not connected"),
            ErrorCode::Io(kind) => write!(f, "i/o error: {}", kind),
        }
    }
}

/// Error delivered to error hooks and observers
#[derive(Error, Debug)]
#[error("{code}")]
pub struct TransportError {
    /// Classified error code
    pub code: ErrorCode,
    /// Underlying failure, when one exists
    #[source]
    pub source: Option<io::Error>,
}

impl TransportError {
    /// Error raised internally without an underlying I/O failure
    pub fn new(code: ErrorCode) -> Self {
        Self { code, source: None }
    }

    /// Error with an explicit code and the failure that caused it
    pub fn with_source(code: ErrorCode, source: io::Error) -> Self {
        Self {
            code,
            source: Some(source),
        }
    }

    /// Whether this error should be swallowed rather than reported
    pub fn is_disconnect(&self) -> bool {
        self.code.is_disconnect()
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self {
            code: ErrorCode::from(&err),
            source: Some(err),
        }
    }
}

/// Errors returned by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session is not connected (or, for TLS sessions, not handshaked yet)
    #[error("session not connected")]
    NotConnected,

    /// Queued bytes would exceed the configured send buffer limit
    #[error("send buffer limit exceeded: {pending} pending + {requested} requested > {limit}")]
    NoBufferSpace {
        /// Bytes already queued
        pending: usize,
        /// Bytes in the rejected call
        requested: usize,
        /// Configured limit
        limit: usize,
    },

    /// Transport failure
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned by server lifecycle operations
#[derive(Error, Debug)]
pub enum ServerError {
    /// Start called on a running server
    #[error("server already started")]
    AlreadyStarted,

    /// Stop called on a stopped server
    #[error("server not started")]
    NotStarted,

    /// Creating, configuring or binding the listening socket failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server tried to bind
        addr: std::net::SocketAddr,
        /// Socket failure
        #[source]
        source: io::Error,
    },
}

/// Errors raised while building a TLS context
#[derive(Error, Debug)]
pub enum TlsContextError {
    /// Reading a PEM file failed
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that could not be read
        path: String,
        /// I/O failure
        #[source]
        source: io::Error,
    },

    /// PEM content did not contain what was expected
    #[error("invalid pem: {0}")]
    Pem(String),

    /// rustls refused the configuration
    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    /// Client certificate verifier could not be built
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}
