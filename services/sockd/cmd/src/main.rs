//! sockd server binary.
//!
//! Runs an echo service on top of the sockd session substrate, over plain
//! TCP or TLS. Received bytes are echoed back to the sender, or broadcast to
//! every session in multicast mode.

use anyhow::Context;
use clap::Parser;
use sockd_session::{
    fallback, Server, ServerHandler, Session, SessionHandler, TlsContext, TlsServer, TcpServer,
    Transport, TransportError,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod logging;

use config::{SockdConfig, TlsConfig};
use logging::LogLevelHandle;

#[derive(Parser, Debug)]
#[command(name = "sockd", version, about = "Stream server with buffered sessions and optional TLS")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides the configuration file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Server certificate chain (PEM)
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// CA bundle for client certificates (PEM)
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Broadcast received bytes to every session
    #[arg(long)]
    multicast: bool,

    /// Log level for the sockd crates
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags take precedence over file and environment
    fn apply_to(&self, config: &mut SockdConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_file = cert.clone();
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_file = key.clone();
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_file = Some(ca.clone());
        }
        if self.multicast {
            config.multicast = true;
        }
    }
}

/// Echoes received bytes, or broadcasts them in multicast mode
struct Echo {
    multicast: bool,
}

impl<T: Transport> SessionHandler<T> for Echo {
    fn on_connected(&self, session: &Arc<Session<T>>) {
        if let Some(peer) = session.peer_addr() {
            component_info!("session", "Session {} connected from {}", session.id(), peer);
        }
    }

    fn on_handshaked(&self, session: &Arc<Session<T>>) {
        component_debug!(
            "session",
            "Session {} handshaked ({} client certificates)",
            session.id(),
            session.peer_certificates().len()
        );
    }

    fn on_disconnected(&self, session: &Arc<Session<T>>) {
        let stats = session.stats();
        component_info!(
            "session",
            "Session {} disconnected (sent {} bytes, received {} bytes)",
            session.id(),
            stats.bytes_sent,
            stats.bytes_received
        );
    }

    fn on_received(&self, session: &Arc<Session<T>>, data: &[u8]) {
        if self.multicast {
            if let Some(server) = session.server() {
                server.multicast(data);
            }
        } else if let Err(e) = session.enqueue(data) {
            component_warn!("session", "Session {} dropped {} bytes: {}", session.id(), data.len(), e);
        }
    }

    fn on_error(&self, session: &Arc<Session<T>>, error: &TransportError) {
        component_error!("session", "Session {} error: {}", session.id(), error);
    }
}

struct EchoServer {
    multicast: bool,
}

impl<T: Transport> ServerHandler<T> for EchoServer {
    fn create_session_handler(&self) -> Arc<dyn SessionHandler<T>> {
        Arc::new(Echo {
            multicast: self.multicast,
        })
    }

    fn on_started(&self, server: &Server<T>) {
        component_info!("server", "Listening on {} ({})", server.endpoint(), T::NAME);
    }

    fn on_stopped(&self, server: &Server<T>) {
        component_info!("server", "Server {} stopped", server.id());
    }

    fn on_error(&self, error: &TransportError) {
        component_error!("server", "Accept failed: {}", error);
    }
}

fn tls_context(tls: &TlsConfig) -> anyhow::Result<TlsContext> {
    let mut builder = TlsContext::from_pem_files(&tls.cert_file, &tls.key_file)
        .context("failed to load server certificate")?;
    if let Some(ca_file) = &tls.ca_file {
        builder = builder
            .client_ca_file(ca_file)
            .context("failed to load client CA bundle")?;
    }
    builder
        .client_certificate_required(tls.client_certificate_required)
        .build()
        .context("failed to build TLS context")
}

/// Run a started server until ctrl-c
async fn serve<T: Transport>(
    server: Arc<Server<T>>,
    stats_interval: Duration,
    levels: LogLevelHandle,
    level: String,
) -> anyhow::Result<()> {
    server
        .start()
        .with_context(|| format!("failed to start server on {}", server.address()))?;

    let stats_task = (!stats_interval.is_zero()).then(|| {
        let server = Arc::downgrade(&server);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                let stats = server.stats();
                component_info!(
                    "stats",
                    "sessions={} pending={} sent={} received={}",
                    stats.connected_sessions,
                    stats.bytes_pending,
                    stats.bytes_sent,
                    stats.bytes_received
                );
            }
        })
    });

    wait_for_shutdown(&levels, &level).await?;

    component_info!("main", "Shutting down");
    if let Some(task) = stats_task {
        task.abort();
    }
    server.stop().await.context("failed to stop server")?;
    Ok(())
}

/// Wait for ctrl-c; on unix SIGUSR1 toggles debug logging
#[cfg(unix)]
async fn wait_for_shutdown(levels: &LogLevelHandle, level: &str) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut toggle = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let mut debug = false;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.context("failed to wait for ctrl-c"),
            _ = toggle.recv() => {
                debug = !debug;
                let next = if debug { "debug" } else { level };
                match levels.switch(next) {
                    Ok(()) => component_info!("main", "Log filter switched to {}", levels.current()?),
                    Err(e) => component_warn!("main", "Failed to switch log level: {:#}", e),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_levels: &LogLevelHandle, _level: &str) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let levels = logging::init("sockd", &args.log_level)?;
    component_info!("main", "Starting sockd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SockdConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    if let Some(dir) = &config.fallback_log_dir {
        fallback::set_root(dir.clone());
    }

    let stats_interval = Duration::from_secs(config.stats_interval_secs);
    let handler = Arc::new(EchoServer {
        multicast: config.multicast,
    });

    if config.tls.enabled {
        let context = tls_context(&config.tls)?;
        let server = TlsServer::tls(context, config.listen, config.options.clone(), handler);
        serve(server, stats_interval, levels, args.log_level).await
    } else {
        let server = TcpServer::tcp(config.listen, config.options.clone(), handler);
        serve(server, stats_interval, levels, args.log_level).await
    }
}
