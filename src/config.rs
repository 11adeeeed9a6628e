//! # Global runtime configuration.
//!
//! [`Config`] defines the daemon's behavior: directories, transport
//! selection, TLS material references, shutdown grace period, channel
//! capacities, restart backoff, and the worker RPC deadline.
//!
//! Values come from a TOML file ([`Config::load`]) layered over
//! [`Config::default`]; the CLI applies its own overrides on top.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use courierd::Config;
//!
//! let mut cfg = Config::default();
//! cfg.grace = Duration::from_secs(10);
//! cfg.log_level = "debug".to_string();
//!
//! assert_eq!(cfg.sendq_capacity, 1024);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::RuntimeError;
use crate::strategy::BackoffStrategy;

/// Remote transport flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Message-broker pub/sub.
    Broker,
    /// HTTP long-poll.
    HttpPoll,
}

/// Source used to derive the client identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientIdSource {
    /// Subject CN of the provisioned client certificate.
    CertCn,
    /// Host canonical machine identifier.
    MachineId,
}

/// Global configuration for the daemon.
#[derive(Clone, Debug)]
pub struct Config {
    /// Logging level passed to the tracing filter and to workers.
    pub log_level: String,
    /// Client certificate file, if the host is enrolled.
    pub cert_file: Option<PathBuf>,
    /// Client private key file.
    pub key_file: Option<PathBuf>,
    /// Additional root CA bundles.
    pub ca_roots: Vec<PathBuf>,
    /// Which remote transport to construct.
    pub transport: TransportKind,
    /// Broker URIs (broker transport only).
    pub brokers: Vec<String>,
    /// Server for the HTTP long-poll transport.
    pub http_server: String,
    /// Prefix applied to remote topics.
    pub topic_prefix: String,
    /// Host override for outbound HTTP data traffic.
    pub data_host: Option<String>,
    /// Local RPC socket address; `None` picks a per-instance default.
    pub socket_addr: Option<String>,
    /// Where the client id comes from.
    pub client_id_source: ClientIdSource,
    /// Directory scanned and watched for `*worker` executables.
    pub worker_dir: PathBuf,
    /// Configuration directory exported to workers and watched for tags.
    pub sysconf_dir: PathBuf,
    /// State directory holding the persisted client id.
    pub state_dir: PathBuf,
    /// Maximum time to wait for workers during graceful shutdown.
    pub grace: Duration,
    /// Deadline applied to every worker-side RPC.
    pub rpc_deadline: Duration,
    /// Capacity of the transport-to-worker queue.
    pub sendq_capacity: usize,
    /// Capacity of the worker-to-transport queue.
    pub recvq_capacity: usize,
    /// Capacity of the event bus channel.
    pub bus_capacity: usize,
    /// Restart backoff applied by every process supervisor.
    pub backoff: BackoffStrategy,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `log_level = "info"`
    /// - `transport = HttpPoll`, `http_server = "localhost:8888"`
    /// - `worker_dir = /usr/libexec/courierd`
    /// - `sysconf_dir = /etc/courierd`, `state_dir = /var/lib/courierd`
    /// - `grace = 6s`, `rpc_deadline = 60s`
    /// - queue capacities 1024, backoff 1s..60s doubling
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            cert_file: None,
            key_file: None,
            ca_roots: Vec::new(),
            transport: TransportKind::HttpPoll,
            brokers: Vec::new(),
            http_server: "localhost:8888".to_string(),
            topic_prefix: "courier".to_string(),
            data_host: None,
            socket_addr: None,
            client_id_source: ClientIdSource::CertCn,
            worker_dir: PathBuf::from("/usr/libexec/courierd"),
            sysconf_dir: PathBuf::from("/etc/courierd"),
            state_dir: PathBuf::from("/var/lib/courierd"),
            grace: Duration::from_secs(6),
            rpc_deadline: Duration::from_secs(60),
            sendq_capacity: 1024,
            recvq_capacity: 1024,
            bus_capacity: 1024,
            backoff: BackoffStrategy::default(),
        }
    }
}

/// On-disk representation of the configuration file.
///
/// Every key is optional; present keys override the built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct FileConfig {
    log_level: Option<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    ca_root: Vec<PathBuf>,
    transport: Option<TransportKind>,
    broker: Vec<String>,
    http_server: Option<String>,
    topic_prefix: Option<String>,
    data_host: Option<String>,
    socket_addr: Option<String>,
    client_id_source: Option<ClientIdSource>,
    worker_dir: Option<PathBuf>,
    sysconf_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    grace_seconds: Option<u64>,
}

impl Config {
    /// Loads configuration from a TOML file layered over the defaults.
    ///
    /// A missing file is not an error; the defaults apply unchanged.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let mut cfg = Config::default();
        if !path.exists() {
            return Ok(cfg);
        }
        let raw = std::fs::read_to_string(path).map_err(|e| RuntimeError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|e| RuntimeError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        cfg.apply(file);
        Ok(cfg)
    }

    fn apply(&mut self, file: FileConfig) {
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if file.cert_file.is_some() {
            self.cert_file = file.cert_file;
        }
        if file.key_file.is_some() {
            self.key_file = file.key_file;
        }
        if !file.ca_root.is_empty() {
            self.ca_roots = file.ca_root;
        }
        if let Some(v) = file.transport {
            self.transport = v;
        }
        if !file.broker.is_empty() {
            self.brokers = file.broker;
        }
        if let Some(v) = file.http_server {
            self.http_server = v;
        }
        if let Some(v) = file.topic_prefix {
            self.topic_prefix = v;
        }
        if file.data_host.is_some() {
            self.data_host = file.data_host;
        }
        if file.socket_addr.is_some() {
            self.socket_addr = file.socket_addr;
        }
        if let Some(v) = file.client_id_source {
            self.client_id_source = v;
        }
        if let Some(v) = file.worker_dir {
            self.worker_dir = v;
        }
        if let Some(v) = file.sysconf_dir {
            self.sysconf_dir = v;
        }
        if let Some(v) = file.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = file.grace_seconds {
            self.grace = Duration::from_secs(v);
        }
    }

    /// Path of the watched tags file.
    pub fn tags_file(&self) -> PathBuf {
        self.sysconf_dir.join("tags.toml")
    }

    /// Path of the persisted client-id file.
    pub fn client_id_file(&self) -> PathBuf {
        self.state_dir.join("client-id")
    }
}
