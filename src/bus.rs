//! Event bus for worker lifecycle events.
//!
//! [`Bus`] fans runtime [`Event`]s out to every interested component: the
//! [`Observer`] attached by the daemon, the alive tracker, and any test
//! harness that subscribes.
//!
//! - [`Bus::publish`] sends an event to all subscribers (non-blocking).
//! - [`Bus::subscribe`] creates a new receiver for consuming events.
//! - [`Bus::attach`] owns the observer delivery loop, including recovery
//!   when a slow observer lags behind the channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::event::Event;
use crate::observer::Observer;

/// Broadcast channel for runtime events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers.
    ///
    /// An event published while nobody listens is dropped; that is normal
    /// during startup and teardown, so it is only traced.
    pub fn publish(&self, ev: Event) {
        if self.tx.send(ev).is_err() {
            trace!("event dropped: no subscribers");
        }
    }

    /// Subscribes to the bus and returns a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Spawns the delivery loop feeding every event to `obs`.
    ///
    /// A lagged receiver skips the overwritten events, reports how many
    /// were missed, and keeps consuming; the loop ends on cancellation or
    /// when the last sender drops.
    pub fn attach<O: Observer + Send + Sync + 'static>(
        &self,
        obs: Arc<O>,
        token: CancellationToken,
    ) {
        let mut rx = self.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => obs.on_event(&ev).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "observer lagged behind the event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<EventKind>>,
    }

    #[async_trait]
    impl Observer for RecordingObserver {
        async fn on_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.kind);
        }
    }

    #[tokio::test]
    async fn attached_observer_receives_published_events() {
        let bus = Bus::new(16);
        let obs = Arc::new(RecordingObserver::default());
        let token = CancellationToken::new();
        // The receiver is created inside attach, so publishing right away is safe.
        bus.attach(obs.clone(), token.clone());

        bus.publish(Event::now(EventKind::WorkerStarting).with_worker("echo-worker"));
        bus.publish(Event::now(EventKind::ShutdownRequested));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = obs.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![EventKind::WorkerStarting, EventKind::ShutdownRequested]
        );
        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_the_delivery_loop() {
        let bus = Bus::new(16);
        let obs = Arc::new(RecordingObserver::default());
        let token = CancellationToken::new();
        bus.attach(obs.clone(), token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(Event::now(EventKind::WorkerStarting));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(obs.seen.lock().unwrap().is_empty());
    }
}
