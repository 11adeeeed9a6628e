//! Remote transport abstraction.
//!
//! The dispatcher holds a capability, not a client: anything that can
//! `start`, `disconnect`, and publish control/data messages satisfies
//! [`Transport`]. Inbound traffic arrives as raw bytes on the channels the
//! daemon hands to the transport at construction time; decoding happens at
//! the consumer.
//!
//! The shipped implementation is [`HttpPollTransport`], an HTTP long-poll
//! client. Broker transports plug in behind the same trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::message::{ControlMessage, Data};

/// Pause between failed long-poll attempts.
const POLL_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error("transport: {reason}")]
pub struct TransportError {
    pub reason: String,
}

impl TransportError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Channels on which inbound remote traffic is delivered to the daemon.
pub struct InboundSinks {
    pub control: mpsc::Sender<Vec<u8>>,
    pub data: mpsc::Sender<Vec<u8>>,
}

/// The capability set the dispatcher requires of a remote plane.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects and begins delivering inbound traffic.
    async fn start(&self) -> Result<(), TransportError>;

    /// Stops delivery, allowing `grace` for in-flight traffic.
    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError>;

    /// Publishes on the control channel.
    async fn send_control(&self, msg: ControlMessage) -> Result<(), TransportError>;

    /// Publishes on the data channel.
    async fn send_data(&self, data: Data) -> Result<(), TransportError>;
}

/// HTTP long-poll client.
///
/// Polls `<base>/<prefix>/<client-id>/{control,data}/in` and publishes to
/// the matching `/out` endpoints. Transient poll failures retry here; the
/// dispatcher never duplicates that logic.
pub struct HttpPollTransport {
    client: reqwest::Client,
    control_base: String,
    data_base: String,
    sinks: InboundSinks,
    poll: Mutex<Option<CancellationToken>>,
}

impl HttpPollTransport {
    /// Builds the client from daemon configuration and TLS material.
    pub fn new(
        cfg: &Config,
        client_id: &str,
        user_agent: &str,
        sinks: InboundSinks,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent.to_string());

        if let (Some(cert), Some(key)) = (&cfg.cert_file, &cfg.key_file) {
            let mut pem = std::fs::read(cert)
                .map_err(|e| TransportError::new(format!("cannot read certificate: {e}")))?;
            let key = std::fs::read(key)
                .map_err(|e| TransportError::new(format!("cannot read key: {e}")))?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| TransportError::new(format!("cannot build identity: {e}")))?;
            builder = builder.identity(identity);
        }
        for root in &cfg.ca_roots {
            let pem = std::fs::read(root)
                .map_err(|e| TransportError::new(format!("cannot read ca root: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::new(format!("cannot parse ca root: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::new(e.to_string()))?;

        let base = |server: &str| {
            let server = if server.starts_with("http://") || server.starts_with("https://") {
                server.to_string()
            } else {
                format!("http://{server}")
            };
            format!("{server}/{}/{client_id}", cfg.topic_prefix)
        };
        let control_base = base(&cfg.http_server);
        let data_base = cfg
            .data_host
            .as_deref()
            .map(base)
            .unwrap_or_else(|| control_base.clone());

        Ok(Self {
            client,
            control_base,
            data_base,
            sinks,
            poll: Mutex::new(None),
        })
    }

    fn spawn_poll_loop(
        &self,
        url: String,
        sink: mpsc::Sender<Vec<u8>>,
        token: CancellationToken,
    ) {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = token.cancelled() => break,
                    res = client.get(&url).send() => res,
                };
                match response {
                    Ok(resp) if resp.status() == reqwest::StatusCode::NO_CONTENT => continue,
                    Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                        Ok(body) if !body.is_empty() => {
                            if sink.send(body.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(url = %url, error = %e, "cannot read long-poll body");
                            tokio::time::sleep(POLL_RETRY).await;
                        }
                    },
                    Ok(resp) => {
                        warn!(url = %url, status = %resp.status(), "unexpected long-poll status");
                        tokio::time::sleep(POLL_RETRY).await;
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "long-poll request failed");
                        tokio::time::sleep(POLL_RETRY).await;
                    }
                }
            }
            debug!(url = %url, "long-poll loop stopped");
        });
    }

    async fn post<T: serde::Serialize>(&self, url: String, body: &T) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TransportError::new(format!(
                "publish to {url} failed with {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpPollTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut poll = self.poll.lock().await;
        if poll.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        self.spawn_poll_loop(
            format!("{}/control/in", self.control_base),
            self.sinks.control.clone(),
            token.clone(),
        );
        self.spawn_poll_loop(
            format!("{}/data/in", self.data_base),
            self.sinks.data.clone(),
            token.clone(),
        );
        *poll = Some(token);
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        let token = self.poll.lock().await.take();
        if let Some(token) = token {
            tokio::time::sleep(grace).await;
            token.cancel();
        }
        Ok(())
    }

    async fn send_control(&self, msg: ControlMessage) -> Result<(), TransportError> {
        self.post(format!("{}/control/out", self.control_base), &msg)
            .await
    }

    async fn send_data(&self, data: Data) -> Result<(), TransportError> {
        self.post(format!("{}/data/out", self.data_base), &data).await
    }
}

/// Recording transport for the test suites.
pub mod testing {
    use std::time::Instant;

    use super::*;

    /// Operation observed by a [`RecordingTransport`].
    #[derive(Debug, Clone)]
    pub enum Op {
        Start,
        Disconnect(Duration),
    }

    #[derive(Default)]
    struct Recorded {
        control: Vec<serde_json::Value>,
        data: Vec<Data>,
        ops: Vec<(Op, Instant)>,
    }

    /// In-memory transport that records everything published through it.
    #[derive(Default)]
    pub struct RecordingTransport {
        inner: std::sync::Mutex<Recorded>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Control messages published so far, as JSON values.
        pub fn control_messages(&self) -> Vec<serde_json::Value> {
            self.inner.lock().unwrap().control.clone()
        }

        /// Data messages published so far.
        pub fn data_messages(&self) -> Vec<Data> {
            self.inner.lock().unwrap().data.clone()
        }

        /// Start/disconnect calls with their timestamps, in order.
        pub fn ops(&self) -> Vec<(Op, Instant)> {
            self.inner.lock().unwrap().ops.clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn start(&self) -> Result<(), TransportError> {
            self.inner
                .lock()
                .unwrap()
                .ops
                .push((Op::Start, Instant::now()));
            Ok(())
        }

        async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
            self.inner
                .lock()
                .unwrap()
                .ops
                .push((Op::Disconnect(grace), Instant::now()));
            Ok(())
        }

        async fn send_control(&self, msg: ControlMessage) -> Result<(), TransportError> {
            let value = serde_json::to_value(&msg)
                .map_err(|e| TransportError::new(e.to_string()))?;
            self.inner.lock().unwrap().control.push(value);
            Ok(())
        }

        async fn send_data(&self, data: Data) -> Result<(), TransportError> {
            self.inner.lock().unwrap().data.push(data);
            Ok(())
        }
    }
}
