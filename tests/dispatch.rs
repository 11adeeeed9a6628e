//! End-to-end dispatch: a real dispatcher socket, an in-process echo
//! worker registering over RPC, and a recording transport standing in for
//! the remote plane.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use courierd::bus::Bus;
use courierd::control::ControlHandler;
use courierd::dispatcher::Dispatcher;
use courierd::message::Data;
use courierd::registry::RegistryHandle;
use courierd::rpc::{
    self, DispatcherRequest, DispatcherResponse, RpcListener, RpcServer, WorkerConfigView,
    WorkerRequest, WorkerResponse,
};
use courierd::transport::testing::RecordingTransport;

struct Harness {
    daemon_addr: String,
    data_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::Sender<Vec<u8>>,
    transport: Arc<RecordingTransport>,
    token: CancellationToken,
    _dispatchers_rx: mpsc::Receiver<()>,
    _dir: tempfile::TempDir,
}

fn start_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let daemon_addr = dir
        .path()
        .join("dispatcher.sock")
        .to_string_lossy()
        .into_owned();

    let token = CancellationToken::new();
    let bus = Bus::new(64);
    let (dispatchers_tx, dispatchers_rx) = mpsc::channel(1);
    let registry = RegistryHandle::spawn(bus.clone(), dispatchers_tx, token.clone());
    let transport = Arc::new(RecordingTransport::new());

    let dispatcher = Dispatcher {
        registry: registry.clone(),
        transport: transport.clone(),
        bus: bus.clone(),
        rpc_deadline: Duration::from_secs(5),
    };
    let (data_tx, data_rx) = mpsc::channel(64);
    let queues = dispatcher.spawn(data_rx, 64, token.clone());

    let listener = RpcListener::bind(&daemon_addr).unwrap();
    let server = RpcServer {
        registry: registry.clone(),
        recvq: queues.recvq_tx.clone(),
        config: WorkerConfigView {
            log_level: "info".into(),
            ca_roots: vec![],
            cert_file: None,
            key_file: None,
        },
        call_deadline: Duration::from_secs(5),
    };
    tokio::spawn(server.serve(listener, token.clone()));

    let control = ControlHandler {
        registry,
        transport: transport.clone(),
        rpc_deadline: Duration::from_secs(1),
    };
    let (control_tx, control_rx) = mpsc::channel(16);
    tokio::spawn(control.run(control_rx, token.clone()));

    Harness {
        daemon_addr,
        data_tx,
        control_tx,
        transport,
        token,
        _dispatchers_rx: dispatchers_rx,
        _dir: dir,
    }
}

async fn call_daemon(addr: &str, req: &WorkerRequest) -> WorkerResponse {
    let mut stream = tokio::net::UnixStream::connect(addr).await.unwrap();
    rpc::write_frame(&mut stream, req).await.unwrap();
    rpc::read_frame(&mut stream).await.unwrap()
}

/// Registers an echo worker that answers every `Dispatch` by sending the
/// payload back through the daemon's `Send` RPC.
async fn start_echo_worker(dir: &Path, daemon_addr: &str) {
    let worker_addr = dir.join("echo.sock").to_string_lossy().into_owned();
    let listener = RpcListener::bind(&worker_addr).unwrap();
    let daemon_addr = daemon_addr.to_string();
    let task_daemon_addr = daemon_addr.clone();

    tokio::spawn(async move {
        let listener = listener;
        let daemon_addr = task_daemon_addr;
        loop {
            let Ok(mut stream) = listener.accept().await else {
                break;
            };
            let daemon_addr = daemon_addr.clone();
            tokio::spawn(async move {
                while let Ok(req) = rpc::read_frame::<_, DispatcherRequest>(&mut stream).await {
                    if let DispatcherRequest::Dispatch { data } = req {
                        let mut reply = Data::new(data.directive.clone(), data.content.clone());
                        reply.response_to = Some(data.message_id.clone());
                        let _ = call_daemon(&daemon_addr, &WorkerRequest::Send { data: reply })
                            .await;
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

    let resp = call_daemon(
        &daemon_addr,
        &WorkerRequest::Register {
            handler: "echo".into(),
            pid: std::process::id(),
            addr: worker_addr,
            detached: false,
            features: HashMap::from([("version".to_string(), "1".to_string())]),
        },
    )
    .await;
    assert!(matches!(resp, WorkerResponse::Registered { accepted: true }));
}

fn inbound(directive: &str, message_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut data = Data::new(directive, payload.to_vec());
    data.message_id = message_id.to_string();
    serde_json::to_vec(&data).unwrap()
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn ping_is_answered_with_a_pong_event() {
    let h = start_harness();

    let ping = serde_json::json!({
        "type": "command",
        "message_id": "m1",
        "version": 1,
        "sent": chrono::Utc::now(),
        "content": {"command": "ping"},
    });
    h.control_tx
        .send(serde_json::to_vec(&ping).unwrap())
        .await
        .unwrap();

    let transport = h.transport.clone();
    wait_for("pong", || !transport.control_messages().is_empty()).await;
    let control = h.transport.control_messages();
    assert_eq!(control.len(), 1);
    assert_eq!(control[0]["content"], "pong");
    assert_eq!(control[0]["response_to"], "m1");
    h.token.cancel();
}

#[tokio::test]
async fn routed_message_is_echoed_back_upstream() {
    let h = start_harness();
    start_echo_worker(h._dir.path(), &h.daemon_addr).await;

    h.data_tx
        .send(inbound("echo", "m2", b"hi"))
        .await
        .unwrap();

    let transport = h.transport.clone();
    wait_for("echo reply", || !transport.data_messages().is_empty()).await;
    let out = h.transport.data_messages();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].response_to.as_deref(), Some("m2"));
    assert_eq!(out[0].content, b"hi");
    h.token.cancel();
}

#[tokio::test]
async fn unknown_directive_produces_no_outbound_traffic() {
    let h = start_harness();

    h.data_tx
        .send(inbound("nope", "m3", b"ignored"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(h.transport.data_messages().is_empty());
    assert!(h.transport.control_messages().is_empty());
    h.token.cancel();
}

#[tokio::test]
async fn messages_for_one_handler_keep_arrival_order() {
    let h = start_harness();
    start_echo_worker(h._dir.path(), &h.daemon_addr).await;

    for i in 0..10 {
        h.data_tx
            .send(inbound("echo", &format!("m{i:02}"), b"x"))
            .await
            .unwrap();
    }

    let transport = h.transport.clone();
    wait_for("all replies", || transport.data_messages().len() == 10).await;
    let replies: Vec<String> = h
        .transport
        .data_messages()
        .into_iter()
        .map(|d| d.response_to.unwrap())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{i:02}")).collect();
    assert_eq!(replies, expected);
    h.token.cancel();
}
