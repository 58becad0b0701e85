//! TCP and TLS transport for sockd sessions.
//!
//! This module provides the acceptor socket setup, per-connection socket
//! options, and the [`Transport`] strategy that turns an accepted
//! [`TcpStream`] into the stream a session reads from and writes to: the
//! socket itself for [`Plain`], a rustls stream for [`Tls`].

use futures::future::BoxFuture;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::error::TlsContextError;
use crate::options::ServerOptions;

/// Result of handing an accepted socket to a transport
pub enum Establish<S> {
    /// The stream is usable right away
    Ready(S),
    /// The stream becomes usable once the handshake future resolves
    Handshake(BoxFuture<'static, io::Result<S>>),
}

/// Strategy selecting how an accepted socket becomes a session stream
pub trait Transport: Send + Sync + 'static {
    /// Stream the session performs I/O on
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Short transport name used in logs
    const NAME: &'static str;

    /// Whether sessions must complete a handshake before data flows.
    ///
    /// Such transports are established only after the connected
    /// notifications fired; others before, so that a connected session can
    /// write right away.
    const HANDSHAKE: bool = false;

    /// Wrap an accepted socket
    fn establish(&self, socket: TcpStream) -> Establish<Self::Stream>;

    /// Certificates the peer presented, if the transport authenticates peers
    fn peer_certificates(_stream: &Self::Stream) -> Vec<CertificateDer<'static>> {
        Vec::new()
    }
}

/// Unencrypted stream transport
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain;

impl Transport for Plain {
    type Stream = TcpStream;

    const NAME: &'static str = "tcp";

    fn establish(&self, socket: TcpStream) -> Establish<TcpStream> {
        Establish::Ready(socket)
    }
}

/// TLS transport; every accepted socket goes through a server handshake
#[derive(Clone)]
pub struct Tls {
    acceptor: TlsAcceptor,
    context: TlsContext,
}

impl Tls {
    /// Create a TLS transport from a context
    pub fn new(context: TlsContext) -> Self {
        Self {
            acceptor: TlsAcceptor::from(context.server_config()),
            context,
        }
    }

    /// Context this transport was built from
    pub fn context(&self) -> &TlsContext {
        &self.context
    }
}

impl Transport for Tls {
    type Stream = tokio_rustls::server::TlsStream<TcpStream>;

    const NAME: &'static str = "tls";

    const HANDSHAKE: bool = true;

    fn establish(&self, socket: TcpStream) -> Establish<Self::Stream> {
        let accept = self.acceptor.accept(socket);
        Establish::Handshake(Box::pin(accept))
    }

    fn peer_certificates(stream: &Self::Stream) -> Vec<CertificateDer<'static>> {
        stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default()
    }
}

/// Certificate, client authentication policy and protocol versions for TLS sessions
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
    client_certificate_required: bool,
}

impl TlsContext {
    /// Start building a context from a certificate chain and its private key
    pub fn builder(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> TlsContextBuilder {
        TlsContextBuilder {
            certs,
            key,
            client_roots: None,
            client_certificate_required: false,
            client_verifier: None,
            protocols: rustls::DEFAULT_VERSIONS.to_vec(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Start building a context from PEM encoded certificate chain and key
    pub fn from_pem(cert_chain_pem: &str, private_key_pem: &str) -> Result<TlsContextBuilder, TlsContextError> {
        let certs = parse_certs(cert_chain_pem)?;
        if certs.is_empty() {
            return Err(TlsContextError::Pem(
                "no certificates found in certificate chain".to_string(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .map_err(|e| TlsContextError::Pem(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| TlsContextError::Pem("no private key found".to_string()))?;

        Ok(Self::builder(certs, key))
    }

    /// Start building a context from PEM files on disk
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<TlsContextBuilder, TlsContextError> {
        let cert_pem = read_pem(cert_path.as_ref())?;
        let key_pem = read_pem(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Use an already assembled rustls configuration
    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            client_certificate_required: false,
        }
    }

    /// rustls configuration handed to each handshake
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// Whether clients must present a certificate
    pub fn client_certificate_required(&self) -> bool {
        self.client_certificate_required
    }
}

/// Builder for [`TlsContext`]
pub struct TlsContextBuilder {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
    client_certificate_required: bool,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
    protocols: Vec<&'static SupportedProtocolVersion>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsContextBuilder {
    /// Trust client certificates issued by the CAs in `ca_pem`
    pub fn client_ca_pem(mut self, ca_pem: &str) -> Result<Self, TlsContextError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_pem)? {
            roots.add(cert)?;
        }
        self.client_roots = Some(roots);
        Ok(self)
    }

    /// Same as [`client_ca_pem`](Self::client_ca_pem), reading the PEM from disk
    pub fn client_ca_file(self, ca_path: impl AsRef<Path>) -> Result<Self, TlsContextError> {
        let ca_pem = read_pem(ca_path.as_ref())?;
        self.client_ca_pem(&ca_pem)
    }

    /// Reject clients that do not present a trusted certificate
    pub fn client_certificate_required(mut self, required: bool) -> Self {
        self.client_certificate_required = required;
        self
    }

    /// Custom client certificate validation; replaces the CA based verifier
    pub fn client_verifier(mut self, verifier: Arc<dyn ClientCertVerifier>) -> Self {
        self.client_verifier = Some(verifier);
        self
    }

    /// Allowed protocol versions
    pub fn protocols(mut self, protocols: &[&'static SupportedProtocolVersion]) -> Self {
        self.protocols = protocols.to_vec();
        self
    }

    /// ALPN protocols offered during the handshake
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Assemble the rustls server configuration
    pub fn build(self) -> Result<TlsContext, TlsContextError> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());

        let verifier = match (self.client_verifier, self.client_roots) {
            (Some(verifier), _) => verifier,
            (None, Some(roots)) => {
                let builder =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider));
                if self.client_certificate_required {
                    builder.build()?
                } else {
                    builder.allow_unauthenticated().build()?
                }
            }
            (None, None) => {
                if self.client_certificate_required {
                    return Err(TlsContextError::Pem(
                        "client certificates required but no client CA configured".to_string(),
                    ));
                }
                WebPkiClientVerifier::no_client_auth()
            }
        };

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&self.protocols)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs, self.key)?;
        config.alpn_protocols = self.alpn_protocols;

        info!(
            "TLS context created (client certificate required: {})",
            self.client_certificate_required
        );
        Ok(TlsContext {
            config: Arc::new(config),
            client_certificate_required: self.client_certificate_required,
        })
    }
}

fn read_pem(path: &Path) -> Result<String, TlsContextError> {
    std::fs::read_to_string(path).map_err(|source| TlsContextError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsContextError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsContextError::Pem(format!("failed to parse certificates: {}", e)))
}

/// Create and bind the acceptor socket without listening yet
pub(crate) fn bind_acceptor(addr: SocketAddr, options: &ServerOptions) -> io::Result<(Socket, SocketAddr)> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(options.reuse_address)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }
    // Must be applied before bind
    if addr.is_ipv6() {
        socket.set_only_v6(!options.dual_mode)?;
    }

    socket.bind(&addr.into())?;
    let local_addr = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "acceptor bound to a non-inet address"))?;

    debug!("Acceptor socket bound to {}", local_addr);
    Ok((socket, local_addr))
}

/// Start listening on a bound acceptor socket
pub(crate) fn listen(socket: Socket, backlog: u32) -> io::Result<TcpListener> {
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Apply keep-alive and no-delay options to an accepted socket
pub(crate) fn apply_socket_options(stream: &TcpStream, options: &ServerOptions) -> io::Result<()> {
    let socket = SockRef::from(stream);

    if options.keep_alive {
        socket.set_keepalive(true)?;
    }
    if options.has_keep_alive_tuning() {
        let mut keepalive = TcpKeepalive::new();
        if let Some(time) = options.keep_alive_time() {
            keepalive = keepalive.with_time(time);
        }
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "windows"
        ))]
        if let Some(interval) = options.keep_alive_interval() {
            keepalive = keepalive.with_interval(interval);
        }
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        ))]
        if let Some(retries) = options.keep_alive_retry_count {
            keepalive = keepalive.with_retries(retries);
        }
        socket.set_tcp_keepalive(&keepalive)?;
    }

    if options.no_delay {
        stream.set_nodelay(true)?;
    }
    Ok(())
}
