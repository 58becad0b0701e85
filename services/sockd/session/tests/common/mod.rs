//! Shared utilities for the session integration tests.

#![allow(dead_code)]

use sockd_session::{
    ErrorCode, ServerHandler, ServerOptions, Session, SessionHandler, SessionId, TcpServer,
    Transport, TransportError,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a test waits for a single event before failing
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook invocation captured by the recording handlers
pub enum Event<T: Transport> {
    Connected(Arc<Session<T>>),
    Handshaking(SessionId),
    Handshaked(Arc<Session<T>>),
    Received(SessionId, Vec<u8>),
    Sent(SessionId, usize),
    Empty(SessionId),
    Error(SessionId, ErrorCode),
    Disconnected(SessionId),
}

impl<T: Transport> Event<T> {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected(_) => "connected",
            Event::Handshaking(_) => "handshaking",
            Event::Handshaked(_) => "handshaked",
            Event::Received(..) => "received",
            Event::Sent(..) => "sent",
            Event::Empty(_) => "empty",
            Event::Error(..) => "error",
            Event::Disconnected(_) => "disconnected",
        }
    }
}

/// Session handler forwarding every hook into a channel, optionally echoing received bytes
pub struct Recorder<T: Transport> {
    events: mpsc::UnboundedSender<Event<T>>,
    echo: bool,
}

impl<T: Transport> SessionHandler<T> for Recorder<T> {
    fn on_connected(&self, session: &Arc<Session<T>>) {
        let _ = self.events.send(Event::Connected(Arc::clone(session)));
    }

    fn on_handshaking(&self, session: &Arc<Session<T>>) {
        let _ = self.events.send(Event::Handshaking(session.id()));
    }

    fn on_handshaked(&self, session: &Arc<Session<T>>) {
        let _ = self.events.send(Event::Handshaked(Arc::clone(session)));
    }

    fn on_disconnected(&self, session: &Arc<Session<T>>) {
        let _ = self.events.send(Event::Disconnected(session.id()));
    }

    fn on_received(&self, session: &Arc<Session<T>>, data: &[u8]) {
        let _ = self.events.send(Event::Received(session.id(), data.to_vec()));
        if self.echo {
            let _ = session.enqueue(data);
        }
    }

    fn on_sent(&self, session: &Arc<Session<T>>, sent: usize, _pending: u64) {
        let _ = self.events.send(Event::Sent(session.id(), sent));
    }

    fn on_empty(&self, session: &Arc<Session<T>>) {
        let _ = self.events.send(Event::Empty(session.id()));
    }

    fn on_error(&self, session: &Arc<Session<T>>, error: &TransportError) {
        let _ = self.events.send(Event::Error(session.id(), error.code));
    }
}

/// Server handler handing a [`Recorder`] to every session
pub struct RecordingServer<T: Transport> {
    events: mpsc::UnboundedSender<Event<T>>,
    echo: bool,
}

impl<T: Transport> ServerHandler<T> for RecordingServer<T> {
    fn create_session_handler(&self) -> Arc<dyn SessionHandler<T>> {
        Arc::new(Recorder {
            events: self.events.clone(),
            echo: self.echo,
        })
    }
}

pub fn recording<T: Transport>(echo: bool) -> (Arc<RecordingServer<T>>, mpsc::UnboundedReceiver<Event<T>>) {
    let (events, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingServer { events, echo }), rx)
}

pub fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// Start a plain server on an ephemeral loopback port
pub fn start_tcp(
    options: ServerOptions,
    echo: bool,
) -> (Arc<TcpServer>, mpsc::UnboundedReceiver<Event<sockd_session::Plain>>) {
    let (handler, rx) = recording(echo);
    let server = TcpServer::tcp(loopback(), options, handler);
    server.start().unwrap();
    (server, rx)
}

pub async fn next_event<T: Transport>(rx: &mut mpsc::UnboundedReceiver<Event<T>>) -> Event<T> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Skip events until `pick` returns a value
pub async fn wait_for<T, R, F>(rx: &mut mpsc::UnboundedReceiver<Event<T>>, mut pick: F) -> R
where
    T: Transport,
    F: FnMut(Event<T>) -> Option<R>,
{
    loop {
        if let Some(found) = pick(next_event(rx).await) {
            return found;
        }
    }
}

pub async fn wait_connected<T: Transport>(rx: &mut mpsc::UnboundedReceiver<Event<T>>) -> Arc<Session<T>> {
    wait_for(rx, |event| match event {
        Event::Connected(session) => Some(session),
        _ => None,
    })
    .await
}

/// Collect events up to and including the disconnect of `id`
pub async fn collect_until_disconnected<T: Transport>(
    rx: &mut mpsc::UnboundedReceiver<Event<T>>,
    id: SessionId,
) -> Vec<Event<T>> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, Event::Disconnected(x) if x == id);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Events that arrive within `window`
pub async fn drain_for<T: Transport>(
    rx: &mut mpsc::UnboundedReceiver<Event<T>>,
    window: Duration,
) -> Vec<Event<T>> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        seen.push(event);
    }
    seen
}
