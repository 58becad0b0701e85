//! Connection acceptor, session registry and lifecycle fan-out.
//!
//! A [`Server`] owns the listening socket and one accept task. Every
//! accepted socket becomes a [`Session`] that is registered before it
//! connects and unregistered after its disconnected notifications fired.

use dashmap::DashMap;
use futures::future::join_all;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ServerError, TransportError};
use crate::handler::{guarded, ServerEvent, ServerHandler, ServerObserver, Stage};
use crate::options::ServerOptions;
use crate::session::{wait_for_shutdown, Session, SessionId};
use crate::transport::{bind_acceptor, listen, Plain, Tls, TlsContext, Transport};

/// Pause after a failed accept, doubled per consecutive failure
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Server accepting unencrypted sessions
pub type TcpServer = Server<Plain>;

/// Server accepting TLS sessions
pub type TlsServer = Server<Tls>;

/// Server-wide byte counters, updated by every session
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) bytes_pending: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.bytes_pending.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }
}

/// Subtract without wrapping below zero
pub(crate) fn sub_saturating(counter: &AtomicU64, value: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

/// Snapshot of the aggregate server statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Sessions currently registered
    pub connected_sessions: usize,
    /// Bytes queued or in flight across all sessions
    pub bytes_pending: u64,
    /// Bytes written since start
    pub bytes_sent: u64,
    /// Bytes received since start
    pub bytes_received: u64,
}

struct Acceptor {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Stream server generic over its [`Transport`]
pub struct Server<T: Transport> {
    id: Uuid,
    address: SocketAddr,
    endpoint: Mutex<SocketAddr>,
    options: ServerOptions,
    transport: T,
    handler: Arc<dyn ServerHandler<T>>,
    observers: RwLock<Vec<Arc<dyn ServerObserver>>>,
    sessions: DashMap<SessionId, Arc<Session<T>>>,
    counters: Counters,
    started: AtomicBool,
    accepting: AtomicBool,
    acceptor: Mutex<Option<Acceptor>>,
}

impl Server<Plain> {
    /// Create an unencrypted server
    pub fn tcp(
        address: SocketAddr,
        options: ServerOptions,
        handler: Arc<dyn ServerHandler<Plain>>,
    ) -> Arc<Self> {
        Self::new(Plain, address, options, handler)
    }
}

impl Server<Tls> {
    /// Create a TLS server from a context
    pub fn tls(
        context: TlsContext,
        address: SocketAddr,
        options: ServerOptions,
        handler: Arc<dyn ServerHandler<Tls>>,
    ) -> Arc<Self> {
        Self::new(Tls::new(context), address, options, handler)
    }
}

impl<T: Transport> Server<T> {
    /// Create a stopped server that will listen on `address`
    pub fn new(
        transport: T,
        address: SocketAddr,
        options: ServerOptions,
        handler: Arc<dyn ServerHandler<T>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            address,
            endpoint: Mutex::new(address),
            options,
            transport,
            handler,
            observers: RwLock::new(Vec::new()),
            sessions: DashMap::new(),
            counters: Counters::default(),
            started: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            acceptor: Mutex::new(None),
        })
    }

    /// Server identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address the server was configured with
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Address the acceptor is bound to; port 0 resolves to the real port after start
    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server options
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Transport the server accepts sessions with
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether the server is started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the accept loop is running
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Aggregate statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connected_sessions: self.sessions.len(),
            bytes_pending: self.counters.bytes_pending.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Subscribe an observer to every server and session event
    pub fn subscribe(&self, observer: Arc<dyn ServerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Subscribe a closure to every server and session event
    pub fn subscribe_fn<F>(&self, observer: F)
    where
        F: Fn(&ServerEvent<'_>) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(observer));
    }

    /// Bind, listen and start accepting connections.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut acceptor = self.acceptor_slot();
        if self.is_started() {
            return Err(ServerError::AlreadyStarted);
        }

        // A restart comes back on the endpoint resolved by the previous start
        let bind_addr = self.endpoint();
        let bind_error = |source| ServerError::Bind {
            addr: bind_addr,
            source,
        };
        let (socket, endpoint) = bind_acceptor(bind_addr, &self.options).map_err(bind_error)?;
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = endpoint;

        guarded("starting", || self.handler.on_starting(self));
        self.publish(&ServerEvent::Starting);

        let listener = listen(socket, self.options.acceptor_backlog).map_err(bind_error)?;

        self.counters.reset();
        self.started.store(true, Ordering::SeqCst);
        info!("{} server {} started on {}", T::NAME, self.id, endpoint);

        guarded("started", || self.handler.on_started(self));
        self.publish(&ServerEvent::Started);

        self.accepting.store(true, Ordering::SeqCst);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(Arc::downgrade(self), listener, shutdown_rx));
        *acceptor = Some(Acceptor { task, shutdown });

        Ok(())
    }

    /// Stop accepting, close the listener and disconnect every session
    pub async fn stop(self: &Arc<Self>) -> Result<(), ServerError> {
        let acceptor = {
            let mut slot = self.acceptor_slot();
            if !self.is_started() {
                return Err(ServerError::NotStarted);
            }
            match slot.take() {
                Some(acceptor) => acceptor,
                None => return Err(ServerError::NotStarted),
            }
        };

        self.accepting.store(false, Ordering::SeqCst);

        guarded("stopping", || self.handler.on_stopping(self));
        self.publish(&ServerEvent::Stopping);

        acceptor.shutdown.send_replace(true);
        if let Err(e) = acceptor.task.await {
            warn!("Accept task of server {} ended abnormally: {}", self.id, e);
        }

        self.disconnect_all().await;
        self.started.store(false, Ordering::SeqCst);
        info!("{} server {} stopped", T::NAME, self.id);

        guarded("stopped", || self.handler.on_stopped(self));
        self.publish(&ServerEvent::Stopped);

        Ok(())
    }

    /// Stop, then start again
    pub async fn restart(self: &Arc<Self>) -> Result<(), ServerError> {
        self.stop().await?;
        self.start()
    }

    /// Queue `data` on every registered session.
    ///
    /// Returns how many sessions accepted the bytes; sessions that are
    /// disconnecting or over their send limit are skipped.
    pub fn multicast(&self, data: &[u8]) -> usize {
        if !self.is_started() || data.is_empty() {
            return 0;
        }
        self.sessions()
            .iter()
            .filter(|session| session.enqueue(data).is_ok())
            .count()
    }

    /// Disconnect every registered session; returns `false` when not started
    pub async fn disconnect_all(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        let sessions = self.sessions();
        join_all(sessions.iter().map(|session| session.disconnect())).await;
        true
    }

    /// Look up a registered session
    pub fn find(&self, id: SessionId) -> Option<Arc<Session<T>>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the registered sessions
    pub fn sessions(&self) -> Vec<Arc<Session<T>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered sessions
    pub fn connected_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn unregister(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            debug!("Session {} unregistered from server {}", id, self.id);
        }
    }

    pub(crate) fn session_stage(&self, session: &Arc<Session<T>>, stage: Stage) {
        guarded(stage.name(), || stage.notify_server(self.handler.as_ref(), session));
        self.publish(&stage.event(session.id()));
    }

    pub(crate) fn publish(&self, event: &ServerEvent<'_>) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            guarded("observer", || observer.on_event(event));
        }
    }

    fn accept_session(self: &Arc<Self>, socket: TcpStream) {
        let handler = self.handler.create_session_handler();
        let session = Session::new(
            Arc::downgrade(self),
            handler,
            self.options.session,
            self.options.disconnect_on_send_error,
        );
        self.sessions.insert(session.id(), Arc::clone(&session));
        session.connect(socket, &self.transport, &self.options);
    }

    fn accept_failed(&self, error: TransportError) {
        if error.is_disconnect() {
            debug!("Accept on {} interrupted: {}", self.endpoint(), error);
            return;
        }
        error!("Accept on {} failed: {}", self.endpoint(), error);
        guarded("error", || self.handler.on_error(&error));
        self.publish(&ServerEvent::Error {
            session: None,
            error: &error,
        });
    }

    fn acceptor_slot(&self) -> MutexGuard<'_, Option<Acceptor>> {
        self.acceptor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn accept_loop<T: Transport>(
    server: Weak<Server<T>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    loop {
        let accepted = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };

        let Some(server) = server.upgrade() else {
            break;
        };
        if !server.is_accepting() {
            break;
        }

        match accepted {
            Ok((socket, peer)) => {
                debug!("Accepted {} connection from {}", T::NAME, peer);
                server.accept_session(socket);
            }
            Err(e) => {
                server.accept_failed(TransportError::from(e));
                failures = failures.saturating_add(1);
                let delay = accept_backoff(failures);
                drop(server);
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        }
        failures = 0;
    }
    debug!("Accept loop finished");
}

/// Delay before accepting again after `failures` consecutive accept errors
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(7);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

impl<T: Transport> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("transport", &T::NAME)
            .field("endpoint", &self.endpoint())
            .field("started", &self.is_started())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        let acceptor = self
            .acceptor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(acceptor) = acceptor {
            acceptor.shutdown.send_replace(true);
            acceptor.task.abort();
        }
    }
}
