//! Lifecycle hooks and observable events.
//!
//! Applications customise sessions through [`SessionHandler`] and servers
//! through [`ServerHandler`]; both come with no-op defaults so only the
//! interesting hooks need an implementation. Any number of
//! [`ServerObserver`]s can additionally subscribe to a server and receive
//! every [`ServerEvent`].
//!
//! For every session transition the session hook fires first, then the
//! server hook, then the observers in subscription order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::TransportError;
use crate::fallback;
use crate::server::Server;
use crate::session::{Session, SessionId};
use crate::transport::Transport;

/// Per-session hooks
#[allow(unused_variables)]
pub trait SessionHandler<T: Transport>: Send + Sync + 'static {
    /// Session is about to become connected
    fn on_connecting(&self, session: &Arc<Session<T>>) {}
    /// Session is connected; plain sessions can exchange data from here on
    fn on_connected(&self, session: &Arc<Session<T>>) {}
    /// TLS handshake is about to start
    fn on_handshaking(&self, session: &Arc<Session<T>>) {}
    /// TLS handshake completed; data can flow
    fn on_handshaked(&self, session: &Arc<Session<T>>) {}
    /// Teardown started
    fn on_disconnecting(&self, session: &Arc<Session<T>>) {}
    /// Teardown completed; the session is about to leave the registry
    fn on_disconnected(&self, session: &Arc<Session<T>>) {}
    /// Bytes arrived from the peer
    fn on_received(&self, session: &Arc<Session<T>>, data: &[u8]) {}
    /// `sent` bytes reached the transport; `pending` bytes are still queued or in flight
    fn on_sent(&self, session: &Arc<Session<T>>, sent: usize, pending: u64) {}
    /// The send queue drained completely
    fn on_empty(&self, session: &Arc<Session<T>>) {}
    /// A genuine transport error occurred
    fn on_error(&self, session: &Arc<Session<T>>, error: &TransportError) {}
}

impl<T: Transport> SessionHandler<T> for () {}

/// Server-wide hooks and the session handler factory
#[allow(unused_variables)]
pub trait ServerHandler<T: Transport>: Send + Sync + 'static {
    /// Create the handler for a freshly accepted session
    fn create_session_handler(&self) -> Arc<dyn SessionHandler<T>> {
        Arc::new(())
    }

    /// Acceptor socket is bound but not listening yet
    fn on_starting(&self, server: &Server<T>) {}
    /// Server is listening
    fn on_started(&self, server: &Server<T>) {}
    /// Stop requested; sessions are still connected
    fn on_stopping(&self, server: &Server<T>) {}
    /// Listener closed and every session disconnected
    fn on_stopped(&self, server: &Server<T>) {}

    /// See [`SessionHandler::on_connecting`]
    fn on_connecting(&self, session: &Arc<Session<T>>) {}
    /// See [`SessionHandler::on_connected`]
    fn on_connected(&self, session: &Arc<Session<T>>) {}
    /// See [`SessionHandler::on_handshaking`]
    fn on_handshaking(&self, session: &Arc<Session<T>>) {}
    /// See [`SessionHandler::on_handshaked`]
    fn on_handshaked(&self, session: &Arc<Session<T>>) {}
    /// See [`SessionHandler::on_disconnecting`]
    fn on_disconnecting(&self, session: &Arc<Session<T>>) {}
    /// See [`SessionHandler::on_disconnected`]
    fn on_disconnected(&self, session: &Arc<Session<T>>) {}

    /// Accepting a connection failed with a genuine error
    fn on_error(&self, error: &TransportError) {}
}

impl<T: Transport> ServerHandler<T> for () {}

/// Event delivered to observers
#[derive(Debug)]
pub enum ServerEvent<'a> {
    /// Server is starting
    Starting,
    /// Server started
    Started,
    /// Server is stopping
    Stopping,
    /// Server stopped
    Stopped,
    /// Session is connecting
    Connecting(SessionId),
    /// Session connected
    Connected(SessionId),
    /// TLS handshake started
    Handshaking(SessionId),
    /// TLS handshake completed
    Handshaked(SessionId),
    /// Session teardown started
    Disconnecting(SessionId),
    /// Session teardown completed
    Disconnected(SessionId),
    /// Bytes received by a session
    Received {
        /// Receiving session
        session: SessionId,
        /// Received bytes
        data: &'a [u8],
    },
    /// Bytes written by a session
    Sent {
        /// Sending session
        session: SessionId,
        /// Bytes written by this operation
        sent: usize,
        /// Bytes still queued or in flight
        pending: u64,
    },
    /// Genuine transport error; `session` is `None` for acceptor errors
    Error {
        /// Failing session
        session: Option<SessionId>,
        /// Classified error
        error: &'a TransportError,
    },
}

/// External subscriber to server events
pub trait ServerObserver: Send + Sync {
    /// Called synchronously for each event
    fn on_event(&self, event: &ServerEvent<'_>);
}

impl<F> ServerObserver for F
where
    F: Fn(&ServerEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent<'_>) {
        self(event)
    }
}

/// Session lifecycle transitions shared by hooks and events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Connecting,
    Connected,
    Handshaking,
    Handshaked,
    Disconnecting,
    Disconnected,
}

impl Stage {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Stage::Connecting => "connecting",
            Stage::Connected => "connected",
            Stage::Handshaking => "handshaking",
            Stage::Handshaked => "handshaked",
            Stage::Disconnecting => "disconnecting",
            Stage::Disconnected => "disconnected",
        }
    }

    pub(crate) fn event(self, id: SessionId) -> ServerEvent<'static> {
        match self {
            Stage::Connecting => ServerEvent::Connecting(id),
            Stage::Connected => ServerEvent::Connected(id),
            Stage::Handshaking => ServerEvent::Handshaking(id),
            Stage::Handshaked => ServerEvent::Handshaked(id),
            Stage::Disconnecting => ServerEvent::Disconnecting(id),
            Stage::Disconnected => ServerEvent::Disconnected(id),
        }
    }

    pub(crate) fn notify_session<T: Transport>(
        self,
        handler: &dyn SessionHandler<T>,
        session: &Arc<Session<T>>,
    ) {
        match self {
            Stage::Connecting => handler.on_connecting(session),
            Stage::Connected => handler.on_connected(session),
            Stage::Handshaking => handler.on_handshaking(session),
            Stage::Handshaked => handler.on_handshaked(session),
            Stage::Disconnecting => handler.on_disconnecting(session),
            Stage::Disconnected => handler.on_disconnected(session),
        }
    }

    pub(crate) fn notify_server<T: Transport>(
        self,
        handler: &dyn ServerHandler<T>,
        session: &Arc<Session<T>>,
    ) {
        match self {
            Stage::Connecting => handler.on_connecting(session),
            Stage::Connected => handler.on_connected(session),
            Stage::Handshaking => handler.on_handshaking(session),
            Stage::Handshaked => handler.on_handshaked(session),
            Stage::Disconnecting => handler.on_disconnecting(session),
            Stage::Disconnected => handler.on_disconnected(session),
        }
    }
}

/// Run a hook, logging instead of unwinding when it panics
pub(crate) fn guarded<F: FnOnce()>(hook: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        fallback::report(&format!("{} hook panicked: {}", hook, reason));
    }
}
