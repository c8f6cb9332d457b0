//! Runtime parameters and their environment overrides.
//!
//! The environment decides which backends run: a dump directory enables the
//! periodic dump, a port enables HTTP, and a host is only honored when HTTP
//! is enabled. Missing or unusable values disable the backend instead of
//! failing startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::http::Middleware;
use crate::record::RecorderConfig;

/// Environment variable holding the dump directory.
pub const PFP_STATUS_DUMP_ENV: &str = "PFP_STATUS_DUMP";
/// Environment variable holding the HTTP bind host.
pub const PFP_STATUS_HOST_ENV: &str = "PFP_STATUS_HOST";
/// Environment variable holding the HTTP port.
pub const PFP_STATUS_PORT_ENV: &str = "PFP_STATUS_PORT";

/// Default HTTP port.
pub const DEFAULT_HTTP_SERVE_PORT: u16 = 33445;
/// Default dump directory.
pub const DEFAULT_DUMP_DIRECTORY: &str = "/run/pfpstatus";
/// Default interval between two dumps.
pub const DEFAULT_DUMP_PERIOD: Duration = Duration::from_secs(10);
/// Default cap on tracked nodes.
pub const DEFAULT_MAX_NODES: usize = 5000;
/// Default number of statuses kept per node.
pub const DEFAULT_MAX_SAMPLES_PER_NODE: usize = 10;

/// HTTP exposure settings.
#[derive(Debug, Clone)]
pub struct HttpParams {
    /// Whether the HTTP server runs.
    pub enabled: bool,
    /// Bind host; empty means all interfaces.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Middlewares, first registered innermost.
    pub middlewares: Vec<Middleware>,
}

impl HttpParams {
    /// Returns the `host:port` string to bind.
    pub fn bind_addr(&self) -> String {
        let host = expand_host(&self.host);
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

fn expand_host(host: &str) -> &str {
    if host.is_empty() { "0.0.0.0" } else { host }
}

/// Periodic dump settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageParams {
    /// Whether the dump loop runs.
    pub enabled: bool,
    /// Directory receiving one file per node.
    pub directory: PathBuf,
    /// Interval between two dumps.
    pub period: Duration,
}

/// All runtime parameters.
#[derive(Debug, Clone)]
pub struct Params {
    /// HTTP exposure.
    pub http: HttpParams,
    /// Periodic dump.
    pub storage: StorageParams,
    /// Recorder bounds.
    pub recorder: RecorderConfig,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            http: HttpParams {
                enabled: true,
                host: String::new(),
                port: DEFAULT_HTTP_SERVE_PORT,
                middlewares: Vec::new(),
            },
            storage: StorageParams {
                enabled: false,
                directory: PathBuf::from(DEFAULT_DUMP_DIRECTORY),
                period: DEFAULT_DUMP_PERIOD,
            },
            recorder: RecorderConfig::default()
                .with_max_nodes(DEFAULT_MAX_NODES)
                .with_node_capacity(DEFAULT_MAX_SAMPLES_PER_NODE),
        }
    }
}

impl Params {
    /// Returns the defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut params = Self::default();
        params.apply_env(|name| std::env::var(name).ok());
        params
    }

    /// Overrides backend toggles and addresses using `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(PFP_STATUS_DUMP_ENV).filter(|dir| !dir.is_empty()) {
            Some(dir) => {
                self.storage.enabled = true;
                self.storage.directory = PathBuf::from(dir);
            }
            None => self.storage.enabled = false,
        }
        // the directory may simply not be mounted in this container
        if self.storage.enabled && !self.storage.directory.is_dir() {
            tracing::info!(
                base_directory = %self.storage.directory.display(),
                "base directory not found, will discard everything"
            );
            self.storage.enabled = false;
        }

        match lookup(PFP_STATUS_PORT_ENV).filter(|port| !port.is_empty()) {
            None => self.http.enabled = false,
            Some(raw) => match parse_port(&raw) {
                Ok(port) => {
                    self.http.enabled = true;
                    self.http.port = port;
                }
                Err(e) => {
                    tracing::error!(error = %e, "parsing dump port");
                    self.http.enabled = false;
                }
            },
        }

        // the host alone never enables HTTP
        if let Some(host) = lookup(PFP_STATUS_HOST_ENV).filter(|_| self.http.enabled) {
            self.http.host = host;
        }
    }
}

/// Parses the value of [`PFP_STATUS_PORT_ENV`].
fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.parse().map_err(|source| ConfigError::InvalidPort {
        value: raw.to_string(),
        source,
    })
}
