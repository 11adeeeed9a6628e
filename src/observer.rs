use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventKind};

#[async_trait]
pub trait Observer {
    async fn on_event(&self, event: &Event);
}

/// Default observer that mirrors bus events onto the tracing subscriber.
pub struct LoggerObserver;

#[async_trait]
impl Observer for LoggerObserver {
    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::WorkerStarting => {
                debug!(worker = ?e.worker, attempt = ?e.attempt, "starting worker");
            }
            EventKind::WorkerRegistered => {
                info!(handler = ?e.handler, pid = ?e.pid, "worker registered");
            }
            EventKind::WorkerUnregistered => {
                info!(handler = ?e.handler, "worker unregistered");
            }
            EventKind::WorkerStopped => {
                debug!(worker = ?e.worker, "worker exited cleanly");
            }
            EventKind::WorkerDied => {
                warn!(worker = ?e.worker, pid = ?e.pid, error = ?e.error, "worker died");
            }
            EventKind::BackoffScheduled => {
                warn!(
                    worker = ?e.worker,
                    delay = ?e.delay,
                    attempt = ?e.attempt,
                    error = ?e.error,
                    "restart scheduled"
                );
            }
            EventKind::DispatchFailed => {
                warn!(handler = ?e.handler, error = ?e.error, "dispatch failed");
            }
            EventKind::StatusPublished => {
                debug!("connection status published");
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!("all workers stopped within grace");
            }
            EventKind::GraceExceeded => {
                error!("shutdown grace exceeded");
            }
        }
    }
}
