//! Daemon configuration: YAML file, environment overrides, defaults.
//!
//! Precedence, lowest to highest: built-in defaults, the config file,
//! `TETHER_*` environment variables, then command-line flags (applied by
//! the caller).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_session::{SecurityConfig, ServerConfig, TlsSettings};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address, `ip:port`.
    pub bind_addr: String,
    /// Preshared key clients must present; `None` disables the gate.
    pub preshared_key: Option<String>,
    /// Idle session cutoff as a humantime string, e.g. `"5m"`.
    pub idle_timeout: Option<String>,
    /// Handshake deadline as a humantime string.
    pub auth_timeout: String,
    /// Largest wire frame accepted or produced, in bytes.
    pub max_frame_size: usize,
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// TLS settings; plain TCP when absent.
    pub tls: Option<TlsConfig>,
}

/// TLS section of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub accept_invalid_client_certs: bool,
    #[serde(default)]
    pub require_client_cert: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            preshared_key: None,
            idle_timeout: None,
            auth_timeout: "10s".to_string(),
            max_frame_size: 16 * 1024 * 1024,
            log_level: "info".to_string(),
            tls: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the file (if given), then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("TETHER_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(key) = std::env::var("TETHER_PRESHARED_KEY") {
            self.preshared_key = if key.is_empty() { None } else { Some(key) };
        }
        if let Ok(timeout) = std::env::var("TETHER_IDLE_TIMEOUT") {
            self.idle_timeout = if timeout.is_empty() {
                None
            } else {
                Some(timeout)
            };
        }
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Translate into the server's runtime configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let bind_addr: SocketAddr = self
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.bind_addr))?;

        let idle_timeout = self
            .idle_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .context("invalid idle_timeout")?;
        let auth_timeout =
            parse_duration(&self.auth_timeout).context("invalid auth_timeout")?;

        let security = match &self.tls {
            Some(tls) => SecurityConfig::Tls(TlsSettings {
                cert_file: tls.cert_file.clone(),
                key_file: tls.key_file.clone(),
                ca_file: tls.ca_file.clone(),
                accept_invalid_client_certs: tls.accept_invalid_client_certs,
                require_client_cert: tls.require_client_cert,
            }),
            None => SecurityConfig::None,
        };

        Ok(ServerConfig {
            bind_addr,
            security,
            preshared_key: self.preshared_key.clone(),
            idle_timeout,
            auth_timeout,
            max_frame_size: self.max_frame_size,
        })
    }
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration {raw:?}"))
}
