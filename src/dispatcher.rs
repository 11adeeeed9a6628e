//! Dispatcher core.
//!
//! The hub between the remote data plane and the local workers. Three
//! loops run until shutdown:
//!
//! - **routing**: decodes inbound frames, resolves the directive against
//!   the registry, and hands the message to that handler's FIFO drainer.
//!   One drainer per handler keeps per-handler order strict while distinct
//!   handlers dispatch in parallel.
//! - **forwarding**: drains worker-produced messages into the transport.
//!   Publish failures are the transport's to retry, not ours.
//! - **deaths**: purges the registry entry of any worker whose process
//!   exited; the registry emits the advertisement token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::DispatchError;
use crate::event::{Event, EventKind};
use crate::message::Data;
use crate::process::WorkerDied;
use crate::registry::RegistryHandle;
use crate::rpc;
use crate::transport::Transport;

const PER_HANDLER_QUEUE: usize = 64;

/// Channel ends the rest of the daemon feeds the dispatcher through.
pub struct DispatcherQueues {
    /// Worker-produced messages bound for the remote plane.
    pub recvq_tx: mpsc::Sender<Data>,
    /// Death notices from the process supervisors.
    pub deaths_tx: mpsc::UnboundedSender<WorkerDied>,
}

pub struct Dispatcher {
    pub registry: RegistryHandle,
    pub transport: Arc<dyn Transport>,
    pub bus: Bus,
    pub rpc_deadline: Duration,
}

impl Dispatcher {
    /// Spawns the routing, forwarding and death loops.
    ///
    /// `data_rx` is the receive end of the channel the transport's inbound
    /// data sink feeds.
    pub fn spawn(
        self,
        data_rx: mpsc::Receiver<Vec<u8>>,
        recvq_capacity: usize,
        token: CancellationToken,
    ) -> DispatcherQueues {
        let (recvq_tx, recvq_rx) = mpsc::channel(recvq_capacity);
        let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();

        let this = Arc::new(self);

        tokio::spawn(this.clone().route_loop(data_rx, recvq_tx.clone(), token.clone()));
        tokio::spawn(this.clone().forward_loop(recvq_rx, token.clone()));
        tokio::spawn(this.deaths_loop(deaths_rx, token));

        DispatcherQueues { recvq_tx, deaths_tx }
    }

    async fn route_loop(
        self: Arc<Self>,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
        recvq_tx: mpsc::Sender<Data>,
        token: CancellationToken,
    ) {
        let mut queues: HashMap<String, mpsc::Sender<(Data, String)>> = HashMap::new();
        loop {
            let raw = tokio::select! {
                _ = token.cancelled() => break,
                msg = data_rx.recv() => match msg {
                    Some(raw) => raw,
                    None => break,
                }
            };

            let data: Data = match serde_json::from_slice(&raw) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "cannot unmarshal data message");
                    continue;
                }
            };
            debug!(message_id = %data.message_id, directive = %data.directive, "routing message");

            let Some(record) = self.registry.lookup(&data.directive).await else {
                self.unknown_handler(data, &recvq_tx).await;
                continue;
            };

            let queue = queues.entry(data.directive.clone()).or_insert_with(|| {
                self.clone()
                    .spawn_drainer(data.directive.clone(), token.child_token())
            });
            if queue.send((data, record.addr)).await.is_err() {
                warn!("handler queue closed, dropping message");
            }
        }
    }

    /// One FIFO per handler: strict order within, parallelism across.
    fn spawn_drainer(
        self: Arc<Self>,
        handler: String,
        token: CancellationToken,
    ) -> mpsc::Sender<(Data, String)> {
        let (tx, mut rx) = mpsc::channel::<(Data, String)>(PER_HANDLER_QUEUE);
        tokio::spawn(async move {
            loop {
                let (data, addr) = tokio::select! {
                    _ = token.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    }
                };
                if let Err(e) = rpc::dispatch(&addr, &data, self.rpc_deadline).await {
                    warn!(
                        handler = %handler,
                        message_id = %data.message_id,
                        error = %e,
                        label = e.as_label(),
                        "cannot dispatch to worker"
                    );
                    self.bus.publish(
                        Event::now(EventKind::DispatchFailed)
                            .with_handler(&handler)
                            .with_error(e.to_string()),
                    );
                }
            }
        });
        tx
    }

    async fn unknown_handler(&self, data: Data, recvq_tx: &mpsc::Sender<Data>) {
        let err = DispatchError::UnknownHandler {
            directive: data.directive.clone(),
        };
        warn!(
            message_id = %data.message_id,
            directive = %data.directive,
            "cannot route message: no worker registered"
        );
        self.bus.publish(
            Event::now(EventKind::DispatchFailed)
                .with_handler(&data.directive)
                .with_error(err.to_string()),
        );
        if data.response_to.is_some() {
            let reply = Data::error_reply(&data, err.to_string());
            if recvq_tx.send(reply).await.is_err() {
                warn!("receive queue closed, dropping error reply");
            }
        }
    }

    async fn forward_loop(
        self: Arc<Self>,
        mut recvq_rx: mpsc::Receiver<Data>,
        token: CancellationToken,
    ) {
        loop {
            let data = tokio::select! {
                _ = token.cancelled() => break,
                msg = recvq_rx.recv() => match msg {
                    Some(data) => data,
                    None => break,
                }
            };
            if let Err(e) = self.transport.send_data(data).await {
                warn!(error = %e, "cannot publish data message");
            }
        }
    }

    async fn deaths_loop(
        self: Arc<Self>,
        mut deaths_rx: mpsc::UnboundedReceiver<WorkerDied>,
        token: CancellationToken,
    ) {
        loop {
            let died = tokio::select! {
                _ = token.cancelled() => break,
                msg = deaths_rx.recv() => match msg {
                    Some(died) => died,
                    None => break,
                }
            };
            if let Some(handler) = self.registry.purge_by_pid(died.pid).await {
                debug!(
                    handler = %handler,
                    pid = died.pid,
                    worker = %died.path.display(),
                    "purged dead worker from registry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::registry::WorkerRecord;
    use crate::rpc::{DispatcherRequest, DispatcherResponse, RpcListener};
    use crate::transport::testing::RecordingTransport;
    use std::path::Path;
    use std::sync::Mutex;

    struct Fixture {
        registry: RegistryHandle,
        transport: Arc<RecordingTransport>,
        data_tx: mpsc::Sender<Vec<u8>>,
        queues: DispatcherQueues,
        dispatchers_rx: mpsc::Receiver<()>,
        token: CancellationToken,
    }

    fn fixture() -> Fixture {
        let token = CancellationToken::new();
        let bus = Bus::new(64);
        let (disp_tx, dispatchers_rx) = mpsc::channel(1);
        let registry = RegistryHandle::spawn(bus.clone(), disp_tx, token.clone());
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher {
            registry: registry.clone(),
            transport: transport.clone(),
            bus,
            rpc_deadline: Duration::from_secs(5),
        };
        let (data_tx, data_rx) = mpsc::channel(64);
        let queues = dispatcher.spawn(data_rx, 64, token.clone());
        Fixture {
            registry,
            transport,
            data_tx,
            queues,
            dispatchers_rx,
            token,
        }
    }

    /// Minimal worker endpoint recording dispatched message ids in order.
    fn fake_worker(dir: &Path, name: &str) -> (String, Arc<Mutex<Vec<String>>>) {
        let addr = dir.join(format!("{name}.sock")).to_string_lossy().into_owned();
        let listener = RpcListener::bind(&addr).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        tokio::spawn(async move {
            let listener = listener;
            loop {
                let Ok(mut stream) = listener.accept().await else {
                    break;
                };
                let record = record.clone();
                tokio::spawn(async move {
                    while let Ok(req) =
                        rpc::read_frame::<_, DispatcherRequest>(&mut stream).await
                    {
                        if let DispatcherRequest::Dispatch { data } = req {
                            record.lock().unwrap().push(data.message_id.clone());
                        }
                        if rpc::write_frame(&mut stream, &DispatcherResponse::Ack)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        (addr, seen)
    }

    fn inbound(directive: &str, message_id: &str, response_to: Option<&str>) -> Vec<u8> {
        let mut data = Data::new(directive, b"payload".to_vec());
        data.kind = MessageType::Data;
        data.message_id = message_id.to_string();
        data.response_to = response_to.map(str::to_string);
        serde_json::to_vec(&data).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn unknown_handler_is_dropped_without_rpc_or_output() {
        let f = fixture();
        f.data_tx
            .send(inbound("nope", "m3", None))
            .await
            .unwrap();
        settle().await;

        assert!(f.transport.data_messages().is_empty());
        assert!(f.transport.control_messages().is_empty());
        f.token.cancel();
    }

    #[tokio::test]
    async fn unknown_handler_with_correlation_reports_an_error_reply() {
        let f = fixture();
        f.data_tx
            .send(inbound("nope", "m3", Some("m2")))
            .await
            .unwrap();
        settle().await;

        let out = f.transport.data_messages();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].response_to.as_deref(), Some("m3"));
        assert_eq!(out[0].metadata["result"], "error");
        f.token.cancel();
    }

    #[tokio::test]
    async fn malformed_json_never_crashes_the_router() {
        let f = fixture();
        f.data_tx.send(b"{{{{".to_vec()).await.unwrap();
        f.data_tx
            .send(inbound("nope", "m9", None))
            .await
            .unwrap();
        settle().await;
        // The loop survived the garbage and processed the next message.
        assert!(f.transport.data_messages().is_empty());
        f.token.cancel();
    }

    #[tokio::test]
    async fn per_handler_order_is_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fixture();
        let (addr, seen) = fake_worker(dir.path(), "echo");
        assert!(
            f.registry
                .register(WorkerRecord {
                    handler: "echo".into(),
                    id: "echo-1".into(),
                    addr,
                    detached: false,
                    features: HashMap::new(),
                    pid: 4242,
                })
                .await
        );
        let _ = f.dispatchers_rx.try_recv();

        for i in 0..20 {
            f.data_tx
                .send(inbound("echo", &format!("m{i:02}"), None))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if seen.lock().unwrap().len() == 20 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("all messages dispatched");

        let observed = seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..20).map(|i| format!("m{i:02}")).collect();
        assert_eq!(observed, expected);
        f.token.cancel();
    }

    #[tokio::test]
    async fn death_notice_purges_the_registration() {
        let f = fixture();
        assert!(
            f.registry
                .register(WorkerRecord {
                    handler: "echo".into(),
                    id: "echo-1".into(),
                    addr: "/nowhere".into(),
                    detached: false,
                    features: HashMap::new(),
                    pid: 31337,
                })
                .await
        );
        f.queues
            .deaths_tx
            .send(WorkerDied {
                path: "/lib/echo-worker".into(),
                pid: 31337,
            })
            .unwrap();
        settle().await;

        assert!(f.registry.lookup("echo").await.is_none());
        f.token.cancel();
    }
}
