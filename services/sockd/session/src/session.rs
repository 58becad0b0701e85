//! Per-connection state machine and buffered I/O pipeline.
//!
//! A [`Session`] is created by its server for every accepted socket. It owns
//! the send buffer pair and the receive buffer, runs one receive task and at
//! most one drain task at a time, and is torn down exclusively through
//! [`Session::disconnect`].
//!
//! Outgoing bytes are appended to the `main` buffer and written to the
//! transport only from the `flush` buffer. The drain task swaps the two when
//! `flush` runs dry, so byte order across [`Session::enqueue`] calls is
//! preserved. The send lock guards bookkeeping only and is never held across
//! an `.await`.

use futures::future::{BoxFuture, FutureExt};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

use crate::buffer::Buffer;
use crate::error::{ErrorCode, SessionError, TransportError};
use crate::handler::{guarded, ServerEvent, SessionHandler, Stage};
use crate::options::{ServerOptions, SessionOptions};
use crate::server::{sub_saturating, Server};
use crate::transport::{apply_socket_options, Establish, Transport};

/// Grace period for a clean transport shutdown (TLS close_notify) during teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Unique session identity, assigned at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Snapshot of a session's byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes queued in the main buffer
    pub bytes_pending: u64,
    /// Bytes swapped into the flush buffer and not written yet
    pub bytes_sending: u64,
    /// Bytes written since connect
    pub bytes_sent: u64,
    /// Bytes received since connect
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct SendState {
    main: Buffer,
    flush: Buffer,
    flush_offset: usize,
    /// A drain task is active
    sending: bool,
    sending_bytes: usize,
}

impl SendState {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            main: Buffer::with_capacity(capacity),
            flush: Buffer::with_capacity(capacity),
            ..Default::default()
        }
    }

    fn outstanding(&self) -> u64 {
        (self.main.len() + self.sending_bytes) as u64
    }
}

/// One accepted connection and its buffered I/O state
pub struct Session<T: Transport> {
    id: SessionId,
    server: Weak<Server<T>>,
    handler: Arc<dyn SessionHandler<T>>,
    options: SessionOptions,
    disconnect_on_send_error: bool,
    peer_addr: OnceLock<SocketAddr>,
    peer_certificates: OnceLock<Vec<CertificateDer<'static>>>,

    needs_handshake: AtomicBool,
    connected: AtomicBool,
    handshaked: AtomicBool,
    disconnecting: AtomicBool,
    disposed: AtomicBool,
    receiving: AtomicBool,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    receive_capacity: AtomicUsize,

    send: Mutex<SendState>,
    writer: tokio::sync::Mutex<Option<WriteHalf<T::Stream>>>,
    shutdown: watch::Sender<bool>,
    handshake_attempt: AtomicU64,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        server: Weak<Server<T>>,
        handler: Arc<dyn SessionHandler<T>>,
        options: SessionOptions,
        disconnect_on_send_error: bool,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: SessionId::new(),
            server,
            handler,
            options,
            disconnect_on_send_error,
            peer_addr: OnceLock::new(),
            peer_certificates: OnceLock::new(),
            needs_handshake: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            receive_capacity: AtomicUsize::new(0),
            send: Mutex::new(SendState::default()),
            writer: tokio::sync::Mutex::new(None),
            shutdown,
            handshake_attempt: AtomicU64::new(0),
        })
    }

    /// Session identity
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Owning server, unless it was dropped
    pub fn server(&self) -> Option<Arc<Server<T>>> {
        self.server.upgrade()
    }

    /// Buffer options the session was created with
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Remote address of the accepted socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr.get().copied()
    }

    /// DER certificate chain presented by the client (TLS sessions only)
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        self.peer_certificates.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the session is connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the TLS handshake completed
    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    /// Whether a teardown is running
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Whether a send flight is active
    pub fn is_sending(&self) -> bool {
        self.send_state().sending
    }

    /// Whether the receive loop is running
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Current receive buffer capacity
    pub fn receive_buffer_capacity(&self) -> usize {
        self.receive_capacity.load(Ordering::Relaxed)
    }

    /// Snapshot of the byte counters
    pub fn stats(&self) -> SessionStats {
        let state = self.send_state();
        SessionStats {
            bytes_pending: state.main.len() as u64,
            bytes_sending: state.sending_bytes as u64,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Whether data may flow: connected, and handshaked when the transport needs it
    fn is_ready(&self) -> bool {
        self.is_connected() && (!self.needs_handshake.load(Ordering::SeqCst) || self.is_handshaked())
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn send_state(&self) -> MutexGuard<'_, SendState> {
        self.send.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the session to an accepted socket and start its lifecycle
    pub(crate) fn connect(self: &Arc<Self>, socket: TcpStream, transport: &T, server_options: &ServerOptions) {
        if let Ok(addr) = socket.peer_addr() {
            let _ = self.peer_addr.set(addr);
        }
        if let Err(e) = apply_socket_options(&socket, server_options) {
            debug!("Failed to apply socket options to session {}: {}", self.id, e);
        }

        *self.send_state() = SendState::with_capacity(self.options.send_buffer_size);
        self.receive_capacity
            .store(self.options.receive_buffer_size.max(1), Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.disposed.store(false, Ordering::SeqCst);

        if T::HANDSHAKE {
            self.needs_handshake.store(true, Ordering::SeqCst);
            self.mark_connected();
            let handshake = match transport.establish(socket) {
                Establish::Handshake(future) => future,
                Establish::Ready(stream) => async move { Ok(stream) }.boxed(),
            };
            self.begin_handshake(handshake);
            return;
        }

        match transport.establish(socket) {
            Establish::Ready(stream) => {
                // Attached before connected fires so a connected session always has a writer
                let Some(reader) = self.attach(stream) else {
                    if let Some(server) = self.server() {
                        server.unregister(self.id);
                    }
                    return;
                };
                self.mark_connected();
                if self.send_state().main.is_empty() {
                    self.fire_empty();
                }
                self.spawn_receive(reader);
            }
            Establish::Handshake(handshake) => {
                self.needs_handshake.store(true, Ordering::SeqCst);
                self.mark_connected();
                self.begin_handshake(handshake);
            }
        }
    }

    fn mark_connected(self: &Arc<Self>) {
        self.fire(Stage::Connecting);
        self.connected.store(true, Ordering::SeqCst);
        self.fire(Stage::Connected);
    }

    fn begin_handshake(self: &Arc<Self>, handshake: BoxFuture<'static, io::Result<T::Stream>>) {
        self.fire(Stage::Handshaking);
        let attempt = self.handshake_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(Arc::clone(self).handshake(handshake, attempt));
    }

    async fn handshake(self: Arc<Self>, handshake: BoxFuture<'static, io::Result<T::Stream>>, attempt: u64) {
        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return,
            result = handshake => result,
        };

        if self.handshake_attempt.load(Ordering::SeqCst) != attempt {
            debug!("Ignoring stale handshake completion for session {}", self.id);
            return;
        }

        match result {
            Ok(stream) => {
                let certificates = T::peer_certificates(&stream);
                let Some(reader) = self.attach(stream) else {
                    return;
                };
                let _ = self.peer_certificates.set(certificates);

                self.handshaked.store(true, Ordering::SeqCst);
                if self.is_shutting_down() || self.disposed.load(Ordering::SeqCst) {
                    self.handshaked.store(false, Ordering::SeqCst);
                    return;
                }

                debug!("Session {} completed {} handshake", self.id, T::NAME);
                self.fire(Stage::Handshaked);
                if self.send_state().main.is_empty() {
                    self.fire_empty();
                }
                self.spawn_receive(reader);
            }
            Err(e) => {
                self.report(TransportError::with_source(ErrorCode::NotConnected, e));
                self.disconnect().await;
            }
        }
    }

    /// Split the stream and install the write half; `None` once teardown started
    fn attach(&self, stream: T::Stream) -> Option<ReadHalf<T::Stream>> {
        let (reader, writer) = tokio::io::split(stream);
        let Ok(mut slot) = self.writer.try_lock() else {
            return None;
        };
        // Teardown signals shutdown before it takes the writer
        if self.is_shutting_down() {
            return None;
        }
        *slot = Some(writer);
        Some(reader)
    }

    fn spawn_receive(self: &Arc<Self>, reader: ReadHalf<T::Stream>) {
        if self.receiving.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(self).receive_loop(reader));
    }

    async fn receive_loop(self: Arc<Self>, mut reader: ReadHalf<T::Stream>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buffer = Buffer::with_capacity(self.options.receive_buffer_size.max(1));

        loop {
            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = reader.read(buffer.read_target()) => result,
            };

            match result {
                Ok(0) => {
                    debug!("Session {} closed by peer", self.id);
                    self.disconnect().await;
                    break;
                }
                Ok(size) => {
                    self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                    if let Some(server) = self.server() {
                        server.counters().bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                    }
                    self.fire_received(&buffer.as_slice()[..size]);

                    let capacity = buffer.capacity();
                    if size == capacity {
                        let grown = capacity * 2;
                        let limit = self.options.receive_buffer_limit;
                        if limit > 0 && grown > limit {
                            self.report(TransportError::new(ErrorCode::NoBufferSpace));
                            self.disconnect().await;
                            break;
                        }
                        buffer.reserve(grown);
                        self.receive_capacity.store(grown, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    self.report(TransportError::from(e));
                    self.disconnect().await;
                    break;
                }
            }
        }

        self.receiving.store(false, Ordering::SeqCst);
    }

    /// Queue bytes for sending without waiting for the transport.
    ///
    /// Fails with [`SessionError::NoBufferSpace`] when a send buffer limit is
    /// configured and the queued bytes would exceed it; nothing is queued in
    /// that case. Must be called from within a tokio runtime.
    pub fn enqueue(self: &Arc<Self>, data: &[u8]) -> Result<(), SessionError> {
        let start_flight = {
            let mut state = self.send_state();
            if !self.is_ready() {
                return Err(SessionError::NotConnected);
            }
            if data.is_empty() {
                return Ok(());
            }

            let limit = self.options.send_buffer_limit;
            let pending = state.main.len();
            if limit > 0 && pending + data.len() > limit {
                drop(state);
                self.report(TransportError::new(ErrorCode::NoBufferSpace));
                return Err(SessionError::NoBufferSpace {
                    pending,
                    requested: data.len(),
                    limit,
                });
            }

            state.main.append(data);
            if let Some(server) = self.server() {
                server.counters().bytes_pending.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            !std::mem::replace(&mut state.sending, true)
        };

        if start_flight {
            tokio::spawn(Arc::clone(self).drain());
        }
        Ok(())
    }

    /// Write the queued bytes until both send buffers are empty
    async fn drain(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let (flush, offset) = {
                let mut guard = self.send_state();
                let state = &mut *guard;
                if !state.sending {
                    return;
                }
                if state.flush.is_empty() {
                    std::mem::swap(&mut state.main, &mut state.flush);
                    state.flush_offset = 0;
                    state.sending_bytes = state.flush.len();
                }
                if state.flush.is_empty() {
                    state.sending = false;
                    drop(guard);
                    self.fire_empty();
                    return;
                }
                (std::mem::take(&mut state.flush), state.flush_offset)
            };

            let written = {
                let mut slot = self.writer.lock().await;
                let Some(writer) = slot.as_mut() else {
                    return;
                };
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => return,
                    result = writer.write(&flush.as_slice()[offset..]) => result,
                }
            };

            let size = match written {
                Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
                other => other,
            };
            match size {
                Ok(size) => {
                    let pending = {
                        let mut guard = self.send_state();
                        let state = &mut *guard;
                        if !state.sending {
                            return;
                        }
                        state.flush = flush;
                        state.flush_offset = offset + size;
                        state.sending_bytes = state.sending_bytes.saturating_sub(size);
                        if state.flush_offset >= state.flush.len() {
                            state.flush.clear();
                            state.flush_offset = 0;
                        }
                        state.outstanding()
                    };

                    self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
                    if let Some(server) = self.server() {
                        let counters = server.counters();
                        counters.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
                        sub_saturating(&counters.bytes_pending, size as u64);
                    }
                    self.fire_sent(size, pending);
                }
                Err(e) => {
                    self.report(TransportError::from(e));
                    if self.disconnect_on_send_error {
                        self.disconnect().await;
                    } else {
                        // Keep the unsent bytes; the next enqueue starts a new flight
                        let mut state = self.send_state();
                        if state.sending {
                            state.flush = flush;
                            state.sending = false;
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Write bytes directly to the transport and wait for completion.
    ///
    /// Returns the number of bytes written. A failed write is reported and,
    /// when `disconnect_on_send_error` is set, disconnects the session.
    pub async fn send(self: &Arc<Self>, data: &[u8]) -> Result<usize, SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut shutdown = self.shutdown.subscribe();
        let result = {
            let mut slot = self.writer.lock().await;
            let Some(writer) = slot.as_mut() else {
                return Err(SessionError::NotConnected);
            };
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return Err(SessionError::NotConnected),
                result = writer.write_all(data) => result,
            }
        };

        match result {
            Ok(()) => {
                self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                if let Some(server) = self.server() {
                    server.counters().bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                let pending = self.send_state().outstanding();
                self.fire_sent(data.len(), pending);
                Ok(data.len())
            }
            Err(e) => {
                let reported = io::Error::new(e.kind(), e.to_string());
                self.report(TransportError::with_source(ErrorCode::from(&e), reported));
                if self.disconnect_on_send_error {
                    self.disconnect().await;
                }
                Err(SessionError::Io(e))
            }
        }
    }

    /// Tear the session down.
    ///
    /// Returns `false` when the session is not connected or another teardown
    /// is already running; concurrent calls collapse into one teardown.
    pub async fn disconnect(self: &Arc<Self>) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return false;
        }
        // A teardown may have completed between the two checks above
        if !self.is_connected() {
            self.disconnecting.store(false, Ordering::SeqCst);
            return false;
        }

        self.fire(Stage::Disconnecting);

        self.shutdown.send_replace(true);
        self.handshake_attempt.fetch_add(1, Ordering::SeqCst);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Session {} transport shutdown failed: {}", self.id, e),
                Err(_) => debug!("Session {} transport shutdown timed out", self.id),
            }
        }

        self.disposed.store(true, Ordering::SeqCst);
        self.handshaked.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.receiving.store(false, Ordering::SeqCst);

        let outstanding = {
            let mut state = self.send_state();
            let outstanding = state.outstanding();
            state.sending = false;
            state.main.clear();
            state.flush.clear();
            state.flush_offset = 0;
            state.sending_bytes = 0;
            outstanding
        };
        if let Some(server) = self.server() {
            sub_saturating(&server.counters().bytes_pending, outstanding);
        }

        self.fire(Stage::Disconnected);
        if let Some(server) = self.server() {
            server.unregister(self.id);
        }

        self.disconnecting.store(false, Ordering::SeqCst);
        true
    }

    /// Schedule [`disconnect`](Self::disconnect) on the runtime.
    ///
    /// Returns whether a teardown was scheduled.
    pub fn disconnect_async(self: &Arc<Self>) -> bool {
        if !self.is_connected() || self.is_disconnecting() {
            return false;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.disconnect().await;
        });
        true
    }

    fn fire(self: &Arc<Self>, stage: Stage) {
        debug!("Session {} {}", self.id, stage.name());
        guarded(stage.name(), || stage.notify_session(self.handler.as_ref(), self));
        if let Some(server) = self.server() {
            server.session_stage(self, stage);
        }
    }

    fn fire_received(self: &Arc<Self>, data: &[u8]) {
        guarded("received", || self.handler.on_received(self, data));
        if let Some(server) = self.server() {
            server.publish(&ServerEvent::Received {
                session: self.id,
                data,
            });
        }
    }

    fn fire_sent(self: &Arc<Self>, sent: usize, pending: u64) {
        guarded("sent", || self.handler.on_sent(self, sent, pending));
        if let Some(server) = self.server() {
            server.publish(&ServerEvent::Sent {
                session: self.id,
                sent,
                pending,
            });
        }
    }

    fn fire_empty(self: &Arc<Self>) {
        guarded("empty", || self.handler.on_empty(self));
    }

    /// Surface a genuine transport error; disconnect-class errors are only logged at debug level
    fn report(self: &Arc<Self>, error: TransportError) {
        if error.is_disconnect() {
            debug!("Session {} transport closed: {}", self.id, error);
            return;
        }

        error!("Session {} error: {}", self.id, error);
        guarded("error", || self.handler.on_error(self, &error));
        if let Some(server) = self.server() {
            server.publish(&ServerEvent::Error {
                session: Some(self.id),
                error: &error,
            });
        }
    }
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &T::NAME)
            .field("peer_addr", &self.peer_addr())
            .field("connected", &self.is_connected())
            .field("handshaked", &self.is_handshaked())
            .finish()
    }
}

/// Resolve once the shutdown flag is raised (or its sender is gone)
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
