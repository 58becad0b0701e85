//! Configuration handling for the sockd service.
//!
//! Settings come from a YAML file, then `SOCKD_*` environment variables,
//! then command line flags (applied by the binary).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sockd_session::ServerOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// sockd service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SockdConfig {
    /// Address the server listens on
    pub listen: SocketAddr,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Acceptor and session options
    pub options: ServerOptions,
    /// Seconds between statistics reports; 0 disables them
    pub stats_interval_secs: u64,
    /// Broadcast received bytes to every session instead of echoing them back
    pub multicast: bool,
    /// Directory of the fallback error log
    pub fallback_log_dir: Option<PathBuf>,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to the certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Path to the private key (PEM)
    pub key_file: PathBuf,
    /// Path to the CA bundle used to verify client certificates
    pub ca_file: Option<PathBuf>,
    /// Reject clients without a trusted certificate
    pub client_certificate_required: bool,
}

impl Default for SockdConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1111)),
            tls: TlsConfig::default(),
            options: ServerOptions::default(),
            stats_interval_secs: 30,
            multicast: false,
            fallback_log_dir: None,
        }
    }
}

impl SockdConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<SockdConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final sockd configuration: listen={}, tls={}, send_buffer_limit={}, receive_buffer_limit={}",
            config.listen,
            config.tls.enabled,
            config.options.session.send_buffer_limit,
            config.options.session.receive_buffer_limit
        );

        Ok(config)
    }

    /// Apply `SOCKD_*` overrides; `lookup` resolves a variable name to its value
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("SOCKD_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid SOCKD_LISTEN value {:?}", listen),
            }
        }

        if let Some(enabled) = lookup("SOCKD_TLS_ENABLED") {
            self.tls.enabled = enabled.eq_ignore_ascii_case("true");
        }
        if let Some(cert_file) = lookup("SOCKD_TLS_CERT_FILE") {
            self.tls.cert_file = cert_file.into();
        }
        if let Some(key_file) = lookup("SOCKD_TLS_KEY_FILE") {
            self.tls.key_file = key_file.into();
        }
        if let Some(ca_file) = lookup("SOCKD_TLS_CA_FILE") {
            self.tls.ca_file = Some(ca_file.into());
        }

        if let Some(limit) = lookup("SOCKD_SEND_BUFFER_LIMIT").and_then(|v| v.parse().ok()) {
            self.options.session.send_buffer_limit = limit;
            info!("Send buffer limit overridden by environment: {}", limit);
        }
        if let Some(limit) = lookup("SOCKD_RECEIVE_BUFFER_LIMIT").and_then(|v| v.parse().ok()) {
            self.options.session.receive_buffer_limit = limit;
            info!("Receive buffer limit overridden by environment: {}", limit);
        }
        if let Some(secs) = lookup("SOCKD_STATS_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.stats_interval_secs = secs;
        }
    }
}
