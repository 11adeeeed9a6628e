//! Daemon lifecycle orchestration.
//!
//! [`Daemon::run`] wires every component together in startup order: orphan
//! sweep, client identity, registry, dispatcher socket, transport,
//! dispatcher loops, advertiser, control handler, tags watcher, the
//! initial worker scan and finally the directory watcher. It then waits
//! for SIGINT/SIGTERM and guarantees worker teardown on the way out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertiser::Advertiser;
use crate::alive::AliveTracker;
use crate::bus::Bus;
use crate::config::{Config, TransportKind};
use crate::control::ControlHandler;
use crate::dispatcher::Dispatcher;
use crate::error::RuntimeError;
use crate::event::{Event, EventKind};
use crate::identity;
use crate::observer::Observer;
use crate::os_signals;
use crate::process::{ProcessState, ProcessSupervisor, WorkerDied};
use crate::registry::RegistryHandle;
use crate::rpc::{self, RpcListener, RpcServer, WorkerConfigView};
use crate::transport::{HttpPollTransport, InboundSinks, Transport};
use crate::watcher::{is_worker_file, TagsWatcher, WorkerDirEvent, WorkerDirWatcher};

/// Grace handed to the transport when the daemon itself goes down.
const SHUTDOWN_DISCONNECT_GRACE: Duration = Duration::from_millis(500);
/// Deadline for the shutdown `Disconnect` broadcast to workers.
const WORKER_DISCONNECT_DEADLINE: Duration = Duration::from_secs(1);

pub struct Daemon<O: Observer + Send + Sync + 'static> {
    pub cfg: Config,
    pub obs: Arc<O>,
    pub bus: Bus,
}

/// Supervisors owned by the running daemon, keyed by executable path.
#[derive(Default)]
struct WorkerSet {
    set: JoinSet<ProcessState>,
    tokens: HashMap<PathBuf, CancellationToken>,
}

impl WorkerSet {
    fn start(
        &mut self,
        path: PathBuf,
        env: Vec<(String, String)>,
        cfg: &Config,
        bus: &Bus,
        deaths: mpsc::UnboundedSender<WorkerDied>,
        runtime_token: &CancellationToken,
    ) {
        debug!(worker = %path.display(), "starting worker");
        let child = runtime_token.child_token();
        if let Some(old) = self.tokens.insert(path.clone(), child.clone()) {
            old.cancel();
        }
        let sup = ProcessSupervisor::new(path, env, cfg.backoff, bus.clone(), deaths);
        self.set.spawn(sup.run(child));
    }

    fn stop(&mut self, path: &Path) {
        if let Some(token) = self.tokens.remove(path) {
            debug!(worker = %path.display(), "stopping worker");
            token.cancel();
        }
    }
}

impl<Obs: Observer + Send + Sync + 'static> Daemon<Obs> {
    pub fn new(cfg: Config, observer: Obs) -> Self {
        Self {
            bus: Bus::new(cfg.bus_capacity),
            obs: Arc::new(observer),
            cfg,
        }
    }

    /// Runs the daemon until SIGINT/SIGTERM.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        let token = CancellationToken::new();
        // The observer outlives the runtime token so the final shutdown
        // events still reach it; its loop ends when the bus closes.
        self.bus.attach(self.obs.clone(), CancellationToken::new());

        let alive = AliveTracker::new();
        alive.spawn_listener(self.bus.subscribe());

        debug!("attempting to kill any orphaned workers");
        kill_orphan_workers(&self.cfg.worker_dir)?;

        let client_id = identity::derive_client_id(&self.cfg)?;
        info!(client_id = %client_id, "derived client id");

        let (dispatchers_tx, dispatchers_rx) = mpsc::channel(1);
        let registry =
            RegistryHandle::spawn(self.bus.clone(), dispatchers_tx.clone(), token.clone());

        let socket_addr = self
            .cfg
            .socket_addr
            .clone()
            .unwrap_or_else(rpc::default_socket_addr);
        let listener = RpcListener::bind(&socket_addr).map_err(|e| RuntimeError::SocketBind {
            addr: socket_addr.clone(),
            source: e,
        })?;
        info!(addr = %socket_addr, "listening on dispatcher socket");

        let (control_tx, control_rx) = mpsc::channel(64);
        let (data_tx, data_rx) = mpsc::channel(self.cfg.sendq_capacity);

        let user_agent = format!("courierd/{}", env!("CARGO_PKG_VERSION"));
        let transport: Arc<dyn Transport> = match self.cfg.transport {
            TransportKind::HttpPoll => Arc::new(
                HttpPollTransport::new(
                    &self.cfg,
                    &client_id,
                    &user_agent,
                    InboundSinks {
                        control: control_tx,
                        data: data_tx,
                    },
                )
                .map_err(|e| RuntimeError::Transport {
                    reason: e.to_string(),
                })?,
            ),
            TransportKind::Broker => {
                return Err(RuntimeError::Transport {
                    reason: "broker transport is not built into this binary".to_string(),
                })
            }
        };
        transport
            .start()
            .await
            .map_err(|e| RuntimeError::Transport {
                reason: e.to_string(),
            })?;

        let dispatcher = Dispatcher {
            registry: registry.clone(),
            transport: transport.clone(),
            bus: self.bus.clone(),
            rpc_deadline: self.cfg.rpc_deadline,
        };
        let queues = dispatcher.spawn(data_rx, self.cfg.recvq_capacity, token.clone());

        let server = RpcServer {
            registry: registry.clone(),
            recvq: queues.recvq_tx.clone(),
            config: self.worker_config_view(),
            call_deadline: self.cfg.rpc_deadline,
        };
        tokio::spawn(server.serve(listener, token.clone()));

        let advertiser = Advertiser {
            registry: registry.clone(),
            transport: transport.clone(),
            tags_file: self.cfg.tags_file(),
            bus: self.bus.clone(),
        };
        tokio::spawn(advertiser.run(dispatchers_rx, token.clone()));

        let control = ControlHandler {
            registry: registry.clone(),
            transport: transport.clone(),
            rpc_deadline: self.cfg.rpc_deadline,
        };
        tokio::spawn(control.run(control_rx, token.clone()));

        let _tags_watcher = match TagsWatcher::spawn(&self.cfg.tags_file(), dispatchers_tx.clone())
        {
            Ok(w) => Some(w),
            Err(e) => {
                info!(file = %self.cfg.tags_file().display(), error = %e, "cannot watch tags file");
                None
            }
        };

        std::fs::create_dir_all(&self.cfg.worker_dir).map_err(|e| RuntimeError::WorkerDir {
            path: self.cfg.worker_dir.clone(),
            source: e,
        })?;
        let env = worker_env(&self.cfg, &socket_addr, &client_id);

        let mut workers = WorkerSet::default();
        let entries =
            std::fs::read_dir(&self.cfg.worker_dir).map_err(|e| RuntimeError::WorkerDir {
                path: self.cfg.worker_dir.clone(),
                source: e,
            })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if is_worker_file(&path) {
                workers.start(
                    path,
                    env.clone(),
                    &self.cfg,
                    &self.bus,
                    queues.deaths_tx.clone(),
                    &token,
                );
            }
        }

        let (dir_tx, mut dir_rx) = mpsc::unbounded_channel();
        let _dir_watcher = match WorkerDirWatcher::spawn(&self.cfg.worker_dir, dir_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(dir = %self.cfg.worker_dir.display(), error = %e, "cannot watch worker directory");
                None
            }
        };

        let shutdown = os_signals::wait_for_shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                ev = dir_rx.recv() => match ev {
                    Some(WorkerDirEvent::Added(path)) => workers.start(
                        path,
                        env.clone(),
                        &self.cfg,
                        &self.bus,
                        queues.deaths_tx.clone(),
                        &token,
                    ),
                    Some(WorkerDirEvent::Removed(path)) => workers.stop(&path),
                    None => {}
                },
            }
        }

        self.bus.publish(Event::now(EventKind::ShutdownRequested));
        self.shutdown(&registry, transport, workers, &alive, token)
            .await
    }

    async fn shutdown(
        &self,
        registry: &RegistryHandle,
        transport: Arc<dyn Transport>,
        mut workers: WorkerSet,
        alive: &AliveTracker,
        token: CancellationToken,
    ) -> Result<(), RuntimeError> {
        // Stop inbound traffic first, then detach the workers.
        let _ = transport.disconnect(SHUTDOWN_DISCONNECT_GRACE).await;
        for (handler, record) in registry.snapshot().await {
            if let Err(e) = rpc::disconnect_worker(&record.addr, WORKER_DISCONNECT_DEADLINE).await
            {
                debug!(handler = %handler, error = %e, "cannot disconnect worker");
            }
        }
        token.cancel();
        self.wait_all_with_grace(&mut workers, alive).await
    }

    async fn wait_all_with_grace(
        &self,
        workers: &mut WorkerSet,
        alive: &AliveTracker,
    ) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        let done = async { while workers.set.join_next().await.is_some() {} };
        let timed = tokio::time::timeout(grace, done).await;

        match timed {
            Ok(_) => {
                self.bus.publish(Event::now(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                self.bus.publish(Event::now(EventKind::GraceExceeded));
                let stuck = alive.snapshot().await;
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }

    fn worker_config_view(&self) -> WorkerConfigView {
        WorkerConfigView {
            log_level: self.cfg.log_level.clone(),
            ca_roots: self
                .cfg
                .ca_roots
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            cert_file: self
                .cfg
                .cert_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            key_file: self
                .cfg
                .key_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Environment handed to every worker process.
pub fn worker_env(cfg: &Config, socket_addr: &str, client_id: &str) -> Vec<(String, String)> {
    vec![
        (
            "YGG_SOCKET_ADDR".to_string(),
            format!("unix:{socket_addr}"),
        ),
        (
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        ),
        (
            "BASE_CONFIG_DIR".to_string(),
            cfg.sysconf_dir.to_string_lossy().into_owned(),
        ),
        ("LOG_LEVEL".to_string(), cfg.log_level.clone()),
        ("DEVICE_ID".to_string(), client_id.to_string()),
    ]
}

/// SIGTERMs every process whose executable lives under the worker directory.
///
/// Cleans up workers orphaned by a previous daemon instance before any new
/// ones are launched.
#[cfg(target_os = "linux")]
fn kill_orphan_workers(worker_dir: &Path) -> Result<(), RuntimeError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let entries = std::fs::read_dir("/proc").map_err(|e| RuntimeError::OrphanSweep {
        reason: e.to_string(),
    })?;
    let own_pid = std::process::id();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(exe) = std::fs::read_link(entry.path().join("exe")) else {
            continue;
        };
        if exe.starts_with(worker_dir) {
            warn!(pid, exe = %exe.display(), "killing orphaned worker");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn kill_orphan_workers(_worker_dir: &Path) -> Result<(), RuntimeError> {
    Ok(())
}
