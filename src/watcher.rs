//! File-system watchers feeding the daemon.
//!
//! Two watchers share the same [`notify`] plumbing:
//!
//! - [`WorkerDirWatcher`] watches the worker directory and reports
//!   added/removed `*worker` executables to the lifecycle orchestrator.
//! - [`TagsWatcher`] watches the tags file and nudges the advertisement
//!   engine whenever it is written or deleted.
//!
//! Both hold their [`RecommendedWatcher`] alive; dropping the struct stops
//! the watch.

use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

/// Change observed in the worker directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDirEvent {
    Added(PathBuf),
    Removed(PathBuf),
}

/// Returns true for files the daemon treats as worker executables.
pub fn is_worker_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with("worker"))
        .unwrap_or(false)
}

/// Watches the worker directory for `*worker` create/remove events.
pub struct WorkerDirWatcher {
    _watcher: RecommendedWatcher,
}

impl WorkerDirWatcher {
    pub fn spawn(
        dir: &Path,
        tx: mpsc::UnboundedSender<WorkerDirEvent>,
    ) -> notify::Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                for path in &event.paths {
                    if !is_worker_file(path) {
                        continue;
                    }
                    let out = match event.kind {
                        EventKind::Create(_) => WorkerDirEvent::Added(path.clone()),
                        EventKind::Remove(_) => WorkerDirEvent::Removed(path.clone()),
                        _ => continue,
                    };
                    let _ = tx.send(out);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher })
    }
}

/// Watches the tags file; every write or delete asks for a re-advertisement.
pub struct TagsWatcher {
    _watcher: RecommendedWatcher,
}

impl TagsWatcher {
    pub fn spawn(file: &Path, dispatchers: mpsc::Sender<()>) -> notify::Result<Self> {
        let watched = file.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                if !event.paths.iter().any(|p| p == &watched) {
                    return;
                }
                debug!(file = %watched.display(), "tags file changed");
                // Full channel: an advertisement is already pending.
                let _ = dispatchers.try_send(());
            },
            notify::Config::default(),
        )?;
        // Watch the parent so deletion and re-creation stay visible.
        let dir = file.parent().unwrap_or(Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher })
    }
}
