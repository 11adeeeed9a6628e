//! Worker subprocess supervision.
//!
//! One [`ProcessSupervisor`] per worker executable. It spawns the child,
//! waits for exit, and restarts on failure with capped exponential backoff
//! ([`BackoffStrategy`]). Exit code 0 is final. On shutdown the child gets
//! SIGTERM and, past the 5 second grace, SIGKILL.
//!
//! Every death, expected or not, is reported to the dispatcher through the
//! dead-worker sink so a stale registration can be purged.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::event::{Event, EventKind};
use crate::strategy::BackoffStrategy;

/// How long a terminated child may linger before SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Death notice posted to the dispatcher on every child exit.
#[derive(Debug, Clone)]
pub struct WorkerDied {
    pub path: PathBuf,
    pub pid: u32,
}

/// Lifecycle of one supervised worker executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running(u32),
    Exited(i32),
    Backoff(Duration),
    Stopped,
}

pub struct ProcessSupervisor {
    path: PathBuf,
    env: Vec<(String, String)>,
    backoff: BackoffStrategy,
    bus: Bus,
    deaths: mpsc::UnboundedSender<WorkerDied>,
}

impl ProcessSupervisor {
    pub fn new(
        path: PathBuf,
        env: Vec<(String, String)>,
        backoff: BackoffStrategy,
        bus: Bus,
        deaths: mpsc::UnboundedSender<WorkerDied>,
    ) -> Self {
        Self {
            path,
            env,
            backoff,
            bus,
            deaths,
        }
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    fn transition(&self, state: ProcessState) {
        debug!(worker = %self.name(), ?state, "state change");
    }

    /// Supervision loop; returns the terminal state.
    pub async fn run(self, token: CancellationToken) -> ProcessState {
        let mut attempt: u64 = 0;
        let mut prev_delay: Option<Duration> = None;

        loop {
            if token.is_cancelled() {
                return ProcessState::Stopped;
            }

            attempt += 1;
            self.transition(ProcessState::Starting);
            self.bus.publish(
                Event::now(EventKind::WorkerStarting)
                    .with_worker(self.name())
                    .with_attempt(attempt),
            );

            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(worker = %self.name(), error = %e, "cannot spawn worker");
                    self.bus.publish(
                        Event::now(EventKind::WorkerDied)
                            .with_worker(self.name())
                            .with_error(e.to_string()),
                    );
                    if !self
                        .wait_backoff(&token, &mut prev_delay, attempt, &e.to_string())
                        .await
                    {
                        return ProcessState::Stopped;
                    }
                    continue;
                }
            };
            let pid = child.id().unwrap_or(0);
            self.transition(ProcessState::Running(pid));

            let started = Instant::now();
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    self.terminate(child, pid).await;
                    self.notify_death(pid);
                    return ProcessState::Stopped;
                }
            };

            self.notify_death(pid);

            match status {
                Ok(st) if st.success() => {
                    self.transition(ProcessState::Exited(0));
                    self.bus
                        .publish(Event::now(EventKind::WorkerStopped).with_worker(self.name()));
                    return ProcessState::Exited(0);
                }
                Ok(st) => {
                    self.transition(ProcessState::Exited(st.code().unwrap_or(-1)));
                    self.bus.publish(
                        Event::now(EventKind::WorkerDied)
                            .with_worker(self.name())
                            .with_pid(pid)
                            .with_error(format!("exit status {st}")),
                    );
                }
                Err(e) => {
                    self.bus.publish(
                        Event::now(EventKind::WorkerDied)
                            .with_worker(self.name())
                            .with_pid(pid)
                            .with_error(e.to_string()),
                    );
                }
            }

            if self.backoff.is_stable(started.elapsed()) {
                prev_delay = None;
            }
            if !self
                .wait_backoff(&token, &mut prev_delay, attempt, "abnormal exit")
                .await
            {
                return ProcessState::Stopped;
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.path);
        cmd.env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        cmd.spawn()
    }

    /// Sleeps out the backoff delay; `false` means the runtime is shutting down.
    async fn wait_backoff(
        &self,
        token: &CancellationToken,
        prev_delay: &mut Option<Duration>,
        attempt: u64,
        reason: &str,
    ) -> bool {
        let delay = self.backoff.next(*prev_delay);
        *prev_delay = Some(delay);
        self.transition(ProcessState::Backoff(delay));
        self.bus.publish(
            Event::now(EventKind::BackoffScheduled)
                .with_worker(self.name())
                .with_delay(delay)
                .with_attempt(attempt)
                .with_error(reason),
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => true,
            _ = token.cancelled() => false,
        }
    }

    async fn terminate(&self, mut child: Child, pid: u32) {
        if pid != 0 {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(worker = %self.name(), pid, error = %e, "SIGTERM failed");
            }
        }
        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(worker = %self.name(), pid, "worker ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }

    fn notify_death(&self, pid: u32) {
        let _ = self.deaths.send(WorkerDied {
            path: self.path.clone(),
            pid,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn fast_backoff() -> BackoffStrategy {
        BackoffStrategy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(40),
            factor: 2.0,
            stable_after: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn clean_exit_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "cleanworker", "exit 0");
        let (deaths_tx, mut deaths_rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(path, vec![], fast_backoff(), Bus::new(16), deaths_tx);

        let state = sup.run(CancellationToken::new()).await;
        assert_eq!(state, ProcessState::Exited(0));
        // Exactly one death notice, then the channel closes.
        assert!(deaths_rx.recv().await.is_some());
        assert!(deaths_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failing_worker_is_restarted_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "crashworker", "exit 1");
        let (deaths_tx, mut deaths_rx) = mpsc::unbounded_channel();
        let bus = Bus::new(64);
        let mut events = bus.subscribe();
        let sup = ProcessSupervisor::new(path, vec![], fast_backoff(), bus, deaths_tx);

        let token = CancellationToken::new();
        let handle = tokio::spawn(sup.run(token.clone()));

        // At least three consecutive deaths means restarts are happening.
        for _ in 0..3 {
            assert!(deaths_rx.recv().await.is_some());
        }
        token.cancel();
        assert_eq!(handle.await.unwrap(), ProcessState::Stopped);

        // Delays grow along the schedule.
        let mut delays = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.kind == EventKind::BackoffScheduled {
                delays.push(ev.delay.unwrap());
            }
        }
        assert!(delays.len() >= 2);
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
    }

    #[tokio::test]
    async fn cancellation_terminates_a_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sleepworker", "sleep 30");
        let (deaths_tx, mut deaths_rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(path, vec![], fast_backoff(), Bus::new(16), deaths_tx);

        let token = CancellationToken::new();
        let handle = tokio::spawn(sup.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let state = tokio::time::timeout(Duration::from_secs(6), handle)
            .await
            .expect("terminate within grace")
            .unwrap();
        assert_eq!(state, ProcessState::Stopped);
        assert!(deaths_rx.recv().await.is_some());
    }
}
