use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use courierd::config::{ClientIdSource, Config, TransportKind};
use courierd::daemon::Daemon;
use courierd::error::RuntimeError;
use courierd::observer::LoggerObserver;
use courierd::telemetry;

/// Connect the host to its remote control plane.
#[derive(Debug, Parser)]
#[command(name = "courierd", version, about)]
struct Cli {
    /// Read config values from FILE.
    #[arg(long, value_name = "FILE", default_value = "/etc/courierd/config.toml")]
    config: PathBuf,

    /// Set the logging output level to LEVEL.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Use FILE as the client certificate.
    #[arg(long, value_name = "FILE")]
    cert_file: Option<PathBuf>,

    /// Use FILE as the client's private key.
    #[arg(long, value_name = "FILE")]
    key_file: Option<PathBuf>,

    /// Use FILE as a root CA.
    #[arg(long = "ca-root", value_name = "FILE", hide = true)]
    ca_root: Vec<PathBuf>,

    /// Use PREFIX as the remote topic prefix.
    #[arg(long, value_name = "PREFIX", hide = true)]
    topic_prefix: Option<String>,

    /// Connect to the broker specified in URI.
    #[arg(long, value_name = "URI")]
    broker: Vec<String>,

    /// Force all HTTP traffic over HOST.
    #[arg(long, value_name = "HOST")]
    data_host: Option<String>,

    /// Force the daemon to listen on SOCKET.
    #[arg(long, value_name = "SOCKET", hide = true)]
    socket_addr: Option<String>,

    /// Force a specific transport (broker, http-poll).
    #[arg(long, value_name = "TRANSPORT", hide = true)]
    transport: Option<String>,

    /// Server to use for the HTTP long-poll transport.
    #[arg(long, value_name = "SERVER", hide = true)]
    http_server: Option<String>,

    /// Source of the client id (cert-cn, machine-id).
    #[arg(long, value_name = "SOURCE", hide = true)]
    client_id_source: Option<String>,

    /// Scan and watch DIR for worker executables.
    #[arg(long, value_name = "DIR")]
    worker_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The subscriber may not be installed yet; stderr always is.
            eprintln!("courierd: {e}");
            error!(label = e.as_label(), "{e}");
            if e.is_fatal() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<(), RuntimeError> {
    let config_path = cli.config.clone();
    let cfg = build_config(cli)?;

    telemetry::initialise(&cfg.log_level).map_err(|e| RuntimeError::Config {
        path: config_path,
        reason: e.to_string(),
    })?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting courierd");

    Daemon::new(cfg, LoggerObserver).run().await
}

fn build_config(cli: Cli) -> Result<Config, RuntimeError> {
    let mut cfg = Config::load(&cli.config)?;

    if let Some(v) = cli.log_level {
        cfg.log_level = v;
    }
    if cli.cert_file.is_some() {
        cfg.cert_file = cli.cert_file;
    }
    if cli.key_file.is_some() {
        cfg.key_file = cli.key_file;
    }
    if !cli.ca_root.is_empty() {
        cfg.ca_roots = cli.ca_root;
    }
    if let Some(v) = cli.topic_prefix {
        cfg.topic_prefix = v;
    }
    if !cli.broker.is_empty() {
        cfg.brokers = cli.broker;
    }
    if cli.data_host.is_some() {
        cfg.data_host = cli.data_host;
    }
    if cli.socket_addr.is_some() {
        cfg.socket_addr = cli.socket_addr;
    }
    if let Some(v) = cli.http_server {
        cfg.http_server = v;
    }
    if let Some(v) = cli.worker_dir {
        cfg.worker_dir = v;
    }
    if let Some(v) = cli.transport {
        cfg.transport = match v.as_str() {
            "broker" => TransportKind::Broker,
            "http-poll" => TransportKind::HttpPoll,
            other => {
                return Err(RuntimeError::Config {
                    path: cli.config,
                    reason: format!("unrecognized transport type: {other}"),
                })
            }
        };
    }
    if let Some(v) = cli.client_id_source {
        cfg.client_id_source = match v.as_str() {
            "cert-cn" => ClientIdSource::CertCn,
            "machine-id" => ClientIdSource::MachineId,
            other => {
                return Err(RuntimeError::Config {
                    path: cli.config,
                    reason: format!("unsupported client id source: {other}"),
                })
            }
        };
    }
    Ok(cfg)
}
