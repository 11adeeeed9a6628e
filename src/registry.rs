//! # Worker registry - single-writer actor owning the handler map.
//!
//! The registry owns the only mutable map in the daemon: handler name →
//! [`WorkerRecord`]. All mutation flows through one owner task consuming
//! [`RegistryCommand`]s from an mpsc channel; readers receive consistent
//! clones over oneshot replies.
//!
//! ## Architecture
//! ```text
//! rpc server ──Register──────►┐
//! dispatcher ──PurgeByPid────►│ owner task ──► dispatchers token (cap 1)
//! control    ──Snapshot──────►│              └─► Bus (registered/unregistered)
//! drainers   ──Lookup────────►┘
//! ```
//!
//! ## Rules
//! - A handler name maps to at most one live worker.
//! - `pid` and `addr` never change after registration.
//! - Every successful mutation emits one token on the `dispatchers`
//!   channel; a full channel means an advertisement is already pending.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::event::{Event, EventKind};
use crate::message::DispatchersMap;

/// A registered worker as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Routing key the worker claimed.
    pub handler: String,
    /// Daemon-assigned registration id.
    pub id: String,
    /// UNIX socket address at which the worker accepts RPCs.
    pub addr: String,
    /// Whether the worker handles detached (fire-and-forget) payloads.
    pub detached: bool,
    /// Opaque feature mapping advertised upstream.
    pub features: HashMap<String, String>,
    /// PID of the worker executable.
    pub pid: u32,
}

enum RegistryCommand {
    Register {
        record: WorkerRecord,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        handler: String,
        reply: oneshot::Sender<bool>,
    },
    PurgeByPid {
        pid: u32,
        reply: oneshot::Sender<Option<String>>,
    },
    Lookup {
        handler: String,
        reply: oneshot::Sender<Option<WorkerRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<HashMap<String, WorkerRecord>>,
    },
}

/// Cloneable handle for talking to the registry owner task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawns the owner task and returns a handle to it.
    ///
    /// `dispatchers` receives one token per successful mutation; give it
    /// capacity 1 so registration bursts coalesce.
    pub fn spawn(
        bus: Bus,
        dispatchers: mpsc::Sender<()>,
        token: CancellationToken,
    ) -> RegistryHandle {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut workers: HashMap<String, WorkerRecord> = HashMap::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => handle_command(&mut workers, cmd, &bus, &dispatchers),
                        None => break,
                    }
                }
            }
        });
        RegistryHandle { tx }
    }

    /// Inserts a record; `false` when the handler is already claimed.
    pub async fn register(&self, record: WorkerRecord) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::Register { record, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Removes the entry for `handler`; `false` when absent.
    pub async fn unregister(&self, handler: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::Unregister {
                handler: handler.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Removes whichever entry belongs to `pid`, returning its handler.
    pub async fn purge_by_pid(&self, pid: u32) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::PurgeByPid { pid, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn lookup(&self, handler: &str) -> Option<WorkerRecord> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Lookup {
                handler: handler.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Consistent copy of the whole registry.
    pub async fn snapshot(&self) -> HashMap<String, WorkerRecord> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// The advertised capability map: handler → features, stably ordered.
    pub async fn dispatchers_map(&self) -> DispatchersMap {
        self.snapshot()
            .await
            .into_iter()
            .map(|(handler, record)| {
                let features: BTreeMap<String, String> = record.features.into_iter().collect();
                (handler, features)
            })
            .collect()
    }
}

fn handle_command(
    workers: &mut HashMap<String, WorkerRecord>,
    cmd: RegistryCommand,
    bus: &Bus,
    dispatchers: &mpsc::Sender<()>,
) {
    match cmd {
        RegistryCommand::Register { record, reply } => {
            let accepted = !workers.contains_key(&record.handler);
            if accepted {
                bus.publish(
                    Event::now(EventKind::WorkerRegistered)
                        .with_handler(&record.handler)
                        .with_pid(record.pid),
                );
                workers.insert(record.handler.clone(), record);
                notify(dispatchers);
            }
            let _ = reply.send(accepted);
        }
        RegistryCommand::Unregister { handler, reply } => {
            let removed = workers.remove(&handler).is_some();
            if removed {
                bus.publish(Event::now(EventKind::WorkerUnregistered).with_handler(&handler));
                notify(dispatchers);
            }
            let _ = reply.send(removed);
        }
        RegistryCommand::PurgeByPid { pid, reply } => {
            let handler = workers
                .iter()
                .find(|(_, r)| r.pid == pid)
                .map(|(h, _)| h.clone());
            if let Some(ref h) = handler {
                workers.remove(h);
                bus.publish(
                    Event::now(EventKind::WorkerUnregistered)
                        .with_handler(h)
                        .with_pid(pid),
                );
                notify(dispatchers);
            }
            let _ = reply.send(handler);
        }
        RegistryCommand::Lookup { handler, reply } => {
            let _ = reply.send(workers.get(&handler).cloned());
        }
        RegistryCommand::Snapshot { reply } => {
            let _ = reply.send(workers.clone());
        }
    }
}

// A full channel means an advertisement already covers the newer state.
fn notify(dispatchers: &mpsc::Sender<()>) {
    let _ = dispatchers.try_send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handler: &str, pid: u32) -> WorkerRecord {
        WorkerRecord {
            handler: handler.to_string(),
            id: format!("{handler}-{pid}"),
            addr: format!("/tmp/{handler}.sock"),
            detached: false,
            features: HashMap::new(),
            pid,
        }
    }

    fn spawn_registry() -> (RegistryHandle, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = RegistryHandle::spawn(Bus::new(16), tx, CancellationToken::new());
        (handle, rx)
    }

    #[tokio::test]
    async fn duplicate_handler_is_rejected() {
        let (reg, _tokens) = spawn_registry();
        assert!(reg.register(record("echo", 100)).await);
        assert!(!reg.register(record("echo", 101)).await);
        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["echo"].pid, 100);
    }

    #[tokio::test]
    async fn handler_is_free_again_after_unregister() {
        let (reg, _tokens) = spawn_registry();
        assert!(reg.register(record("echo", 100)).await);
        assert!(reg.unregister("echo").await);
        assert!(!reg.unregister("echo").await);
        assert!(reg.register(record("echo", 102)).await);
    }

    #[tokio::test]
    async fn purge_by_pid_removes_the_dead_worker_only() {
        let (reg, _tokens) = spawn_registry();
        assert!(reg.register(record("echo", 100)).await);
        assert!(reg.register(record("facts", 200)).await);
        assert_eq!(reg.purge_by_pid(100).await.as_deref(), Some("echo"));
        assert_eq!(reg.purge_by_pid(100).await, None);
        assert!(reg.lookup("echo").await.is_none());
        assert!(reg.lookup("facts").await.is_some());
    }

    #[tokio::test]
    async fn registration_burst_leaves_a_single_pending_token() {
        let (reg, mut tokens) = spawn_registry();
        for i in 0..5 {
            assert!(reg.register(record(&format!("h{i}"), 100 + i)).await);
        }
        // Capacity 1: the burst coalesces into exactly one pending token.
        assert!(tokens.try_recv().is_ok());
        assert!(tokens.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatchers_map_reflects_features() {
        let (reg, _tokens) = spawn_registry();
        let mut rec = record("echo", 100);
        rec.features.insert("version".into(), "1".into());
        reg.register(rec).await;
        let map = reg.dispatchers_map().await;
        assert_eq!(map["echo"]["version"], "1");
    }
}
