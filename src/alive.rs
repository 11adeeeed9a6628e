//! # Tracks currently alive (running) workers.
//!
//! [`AliveTracker`] subscribes to runtime events and maintains a set of
//! active worker names. It listens for [`EventKind::WorkerStarting`],
//! [`EventKind::WorkerStopped`] and [`EventKind::WorkerDied`] to update
//! its state.
//!
//! This is primarily used by the [`Daemon`](crate::daemon::Daemon) to
//! report which workers are still alive when the shutdown grace period
//! runs out.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::event::{Event, EventKind};

/// Tracks which workers are currently alive (running).
///
/// Listens for worker lifecycle events via a broadcast channel:
/// - [`EventKind::WorkerStarting`] inserts the worker name.
/// - [`EventKind::WorkerStopped`] / [`EventKind::WorkerDied`] remove it.
#[derive(Clone)]
pub struct AliveTracker {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl AliveTracker {
    /// Creates a new, empty tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawns a background listener that subscribes to the given event stream.
    pub fn spawn_listener(&self, mut rx: tokio::sync::broadcast::Receiver<Event>) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            while let Ok(ev) = rx.recv().await {
                match ev.kind {
                    EventKind::WorkerStarting => {
                        if let Some(name) = ev.worker.clone() {
                            inner.lock().await.insert(name);
                        }
                    }
                    EventKind::WorkerStopped | EventKind::WorkerDied => {
                        if let Some(name) = ev.worker.clone() {
                            inner.lock().await.remove(&name);
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    /// Returns a snapshot of currently alive workers as a vector of names.
    pub async fn snapshot(&self) -> Vec<String> {
        let g = self.inner.lock().await;
        g.iter().cloned().collect()
    }
}

impl Default for AliveTracker {
    fn default() -> Self {
        Self::new()
    }
}
