use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ShutdownRequested,
    BackoffScheduled,
    AllStoppedWithin,
    GraceExceeded,
    WorkerStarting,
    WorkerRegistered,
    WorkerUnregistered,
    WorkerStopped,
    WorkerDied,
    DispatchFailed,
    StatusPublished,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub delay: Option<Duration>,
    pub error: Option<String>,
    pub attempt: Option<u64>,
    pub worker: Option<String>,
    pub handler: Option<String>,
    pub pid: Option<u32>,
    pub kind: EventKind,
    pub at: SystemTime,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            at: SystemTime::now(),
            attempt: None,
            error: None,
            delay: None,
            worker: None,
            handler: None,
            pid: None,
        }
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    pub fn with_worker(mut self, name: impl Into<String>) -> Self {
        self.worker = Some(name.into());
        self
    }

    pub fn with_handler(mut self, name: impl Into<String>) -> Self {
        self.handler = Some(name.into());
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn with_attempt(mut self, n: u64) -> Self {
        self.attempt = Some(n);
        self
    }
}
