//! Local RPC between the daemon and worker processes.
//!
//! Workers reach the daemon on its dispatcher socket; the daemon reaches
//! each worker on the address the worker supplied at registration. Both
//! directions speak the same framing: a 4-byte big-endian length prefix
//! followed by a JSON body. One request per frame, one response frame per
//! request; connections may carry any number of request/response pairs.
//!
//! Addresses are either filesystem paths or, prefixed with `@`, Linux
//! abstract socket names. Abstract names leave nothing to clean up;
//! filesystem sockets are unlinked when the listener drops.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::message::Data;
use crate::registry::{RegistryHandle, WorkerRecord};

const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// RPCs a worker may invoke on the daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum WorkerRequest {
    Register {
        handler: String,
        pid: u32,
        addr: String,
        detached: bool,
        #[serde(default)]
        features: HashMap<String, String>,
    },
    Send {
        data: Data,
    },
    GetConfig,
}

/// Daemon replies to [`WorkerRequest`]s.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", content = "body", rename_all = "snake_case")]
pub enum WorkerResponse {
    Registered {
        accepted: bool,
    },
    Sent {
        message_id: String,
    },
    Config {
        log_level: String,
        ca_roots: Vec<String>,
        cert_file: Option<String>,
        key_file: Option<String>,
    },
    Error {
        message: String,
    },
}

/// RPCs the daemon invokes on a worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum DispatcherRequest {
    Dispatch { data: Data },
    Disconnect,
}

/// Worker replies to [`DispatcherRequest`]s.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatcherResponse {
    Ack,
    Error { message: String },
}

/// The subset of daemon configuration exposed to workers over `GetConfig`.
#[derive(Debug, Clone)]
pub struct WorkerConfigView {
    pub log_level: String,
    pub ca_roots: Vec<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// Picks the per-instance default dispatcher address.
///
/// Linux gets an abstract name; elsewhere a socket file under the
/// system temp directory stands in (addressing equivalence only).
pub fn default_socket_addr() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..6].to_string();
    if cfg!(target_os = "linux") {
        format!("@courierd-dispatcher-{suffix}")
    } else {
        std::env::temp_dir()
            .join(format!("courierd-dispatcher-{suffix}.sock"))
            .to_string_lossy()
            .into_owned()
    }
}

/// Bound dispatcher socket. Dropping it removes a filesystem socket file.
pub struct RpcListener {
    listener: UnixListener,
    addr: String,
    path: Option<PathBuf>,
}

impl RpcListener {
    /// Binds the given address (`@name` abstract or filesystem path).
    pub fn bind(addr: &str) -> io::Result<RpcListener> {
        if let Some(name) = addr.strip_prefix('@') {
            bind_abstract(addr, name)
        } else {
            let path = PathBuf::from(addr);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            Ok(RpcListener {
                listener,
                addr: addr.to_string(),
                path: Some(path),
            })
        }
    }

    /// The address workers should be pointed at.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Waits for the next worker connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(addr: &str, name: &str) -> io::Result<RpcListener> {
    use std::os::linux::net::SocketAddrExt;

    let sock_addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let std_listener = std::os::unix::net::UnixListener::bind_addr(&sock_addr)?;
    std_listener.set_nonblocking(true)?;
    Ok(RpcListener {
        listener: UnixListener::from_std(std_listener)?,
        addr: addr.to_string(),
        path: None,
    })
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(addr: &str, _name: &str) -> io::Result<RpcListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket '{addr}' requires Linux"),
    ))
}

async fn connect(addr: &str) -> io::Result<UnixStream> {
    if let Some(name) = addr.strip_prefix('@') {
        connect_abstract(name).await
    } else {
        UnixStream::connect(addr).await
    }
}

#[cfg(target_os = "linux")]
async fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let name = name.to_string();
    let std_stream = tokio::task::spawn_blocking(move || {
        let sock_addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let stream = std::os::unix::net::UnixStream::connect_addr(&sock_addr)?;
        stream.set_nonblocking(true)?;
        Ok::<_, io::Error>(stream)
    })
    .await
    .map_err(|e| io::Error::other(e.to_string()))??;
    UnixStream::from_std(std_stream)
}

#[cfg(not(target_os = "linux"))]
async fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket '@{name}' requires Linux"),
    ))
}

pub async fn write_frame<W, T>(io: &mut W, msg: &T) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    io.write_u32(body.len() as u32).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(io: &mut R) -> Result<T, DispatchError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = io.read_u32().await?;
    if len > MAX_FRAME {
        return Err(DispatchError::Decode {
            reason: format!("frame of {len} bytes exceeds limit"),
        });
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Serves worker-initiated RPCs on the dispatcher socket.
pub struct RpcServer {
    pub registry: RegistryHandle,
    pub recvq: mpsc::Sender<Data>,
    pub config: WorkerConfigView,
    pub call_deadline: Duration,
}

impl RpcServer {
    /// Accept loop; runs until the token is cancelled.
    pub async fn serve(self, listener: RpcListener, token: CancellationToken) {
        debug!(addr = %listener.addr(), "listening on dispatcher socket");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let registry = self.registry.clone();
                        let recvq = self.recvq.clone();
                        let config = self.config.clone();
                        let deadline = self.call_deadline;
                        let conn_token = token.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, registry, recvq, config, deadline, conn_token)
                                .await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot accept worker connection");
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    registry: RegistryHandle,
    recvq: mpsc::Sender<Data>,
    config: WorkerConfigView,
    deadline: Duration,
    token: CancellationToken,
) {
    loop {
        let request: WorkerRequest = tokio::select! {
            _ = token.cancelled() => return,
            frame = read_frame(&mut stream) => match frame {
                Ok(req) => req,
                Err(DispatchError::Rpc { .. }) => return, // peer closed
                Err(e) => {
                    warn!(error = %e, "cannot decode worker request");
                    let _ = write_frame(
                        &mut stream,
                        &WorkerResponse::Error { message: e.to_string() },
                    )
                    .await;
                    return;
                }
            },
        };

        let response =
            match tokio::time::timeout(deadline, handle_request(request, &registry, &recvq, &config))
                .await
            {
                Ok(resp) => resp,
                Err(_) => WorkerResponse::Error {
                    message: format!("call deadline {deadline:?} exceeded"),
                },
            };

        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(error = %e, "cannot write worker response");
            return;
        }
    }
}

async fn handle_request(
    request: WorkerRequest,
    registry: &RegistryHandle,
    recvq: &mpsc::Sender<Data>,
    config: &WorkerConfigView,
) -> WorkerResponse {
    match request {
        WorkerRequest::Register {
            handler,
            pid,
            addr,
            detached,
            features,
        } => {
            let record = WorkerRecord {
                handler,
                id: Uuid::new_v4().to_string(),
                addr,
                detached,
                features,
                pid,
            };
            let accepted = registry.register(record).await;
            WorkerResponse::Registered { accepted }
        }
        WorkerRequest::Send { mut data } => {
            if data.message_id.is_empty() {
                data.message_id = Uuid::new_v4().to_string();
            }
            let message_id = data.message_id.clone();
            match recvq.send(data).await {
                Ok(()) => WorkerResponse::Sent { message_id },
                Err(_) => WorkerResponse::Error {
                    message: DispatchError::QueueClosed.to_string(),
                },
            }
        }
        WorkerRequest::GetConfig => WorkerResponse::Config {
            log_level: config.log_level.clone(),
            ca_roots: config.ca_roots.clone(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
        },
    }
}

/// Delivers one data message to a worker, bounded by `deadline`.
pub async fn dispatch(addr: &str, data: &Data, deadline: Duration) -> Result<(), DispatchError> {
    tokio::time::timeout(deadline, async {
        let mut stream = connect(addr).await?;
        write_frame(&mut stream, &DispatcherRequest::Dispatch { data: data.clone() }).await?;
        match read_frame::<_, DispatcherResponse>(&mut stream).await? {
            DispatcherResponse::Ack => Ok(()),
            DispatcherResponse::Error { message } => Err(DispatchError::Rpc { reason: message }),
        }
    })
    .await
    .unwrap_or(Err(DispatchError::Deadline { deadline }))
}

/// Tells one worker the remote plane is going away, bounded by `deadline`.
pub async fn disconnect_worker(addr: &str, deadline: Duration) -> Result<(), DispatchError> {
    tokio::time::timeout(deadline, async {
        let mut stream = connect(addr).await?;
        write_frame(&mut stream, &DispatcherRequest::Disconnect).await?;
        match read_frame::<_, DispatcherResponse>(&mut stream).await? {
            DispatcherResponse::Ack => Ok(()),
            DispatcherResponse::Error { message } => Err(DispatchError::Rpc { reason: message }),
        }
    })
    .await
    .unwrap_or(Err(DispatchError::Deadline { deadline }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    fn server_parts() -> (RegistryHandle, mpsc::Receiver<Data>, RpcServer) {
        let (disp_tx, _disp_rx) = mpsc::channel(1);
        let registry = RegistryHandle::spawn(Bus::new(16), disp_tx, CancellationToken::new());
        let (recv_tx, recv_rx) = mpsc::channel(16);
        let server = RpcServer {
            registry: registry.clone(),
            recvq: recv_tx,
            config: WorkerConfigView {
                log_level: "info".into(),
                ca_roots: vec![],
                cert_file: None,
                key_file: None,
            },
            call_deadline: Duration::from_secs(5),
        };
        (registry, recv_rx, server)
    }

    async fn call(addr: &str, req: &WorkerRequest) -> WorkerResponse {
        let mut stream = connect(addr).await.unwrap();
        write_frame(&mut stream, req).await.unwrap();
        read_frame(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn register_send_and_get_config() {
        let dir = tempfile::tempdir().unwrap();
        let addr = dir.path().join("dispatcher.sock").to_string_lossy().into_owned();
        let (registry, mut recv_rx, server) = server_parts();
        let listener = RpcListener::bind(&addr).unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.serve(listener, token.clone()));

        let resp = call(
            &addr,
            &WorkerRequest::Register {
                handler: "echo".into(),
                pid: 4242,
                addr: dir.path().join("worker.sock").to_string_lossy().into_owned(),
                detached: false,
                features: HashMap::new(),
            },
        )
        .await;
        assert!(matches!(resp, WorkerResponse::Registered { accepted: true }));
        assert!(registry.lookup("echo").await.is_some());

        // Duplicate handler is refused.
        let resp = call(
            &addr,
            &WorkerRequest::Register {
                handler: "echo".into(),
                pid: 4243,
                addr: "unused".into(),
                detached: false,
                features: HashMap::new(),
            },
        )
        .await;
        assert!(matches!(resp, WorkerResponse::Registered { accepted: false }));

        let data = Data::new("echo", b"hi".to_vec());
        let sent_id = data.message_id.clone();
        let resp = call(&addr, &WorkerRequest::Send { data }).await;
        match resp {
            WorkerResponse::Sent { message_id } => assert_eq!(message_id, sent_id),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(recv_rx.recv().await.unwrap().message_id, sent_id);

        let resp = call(&addr, &WorkerRequest::GetConfig).await;
        match resp {
            WorkerResponse::Config { log_level, .. } => assert_eq!(log_level, "info"),
            other => panic!("unexpected response: {other:?}"),
        }

        token.cancel();
    }

    #[tokio::test]
    async fn socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        let addr = path.to_string_lossy().into_owned();
        let listener = RpcListener::bind(&addr).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dispatch_times_out_against_a_silent_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mute.sock");
        let addr = path.to_string_lossy().into_owned();
        // Bind but never answer.
        let _listener = RpcListener::bind(&addr).unwrap();

        let data = Data::new("echo", Vec::new());
        let err = dispatch(&addr, &data, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "dispatch_deadline");
    }
}
