//! Control-plane command handling.
//!
//! Interprets commands arriving on the transport's control channel:
//! `ping` answers with a pong event, `disconnect` detaches the workers and
//! the transport, `reconnect` bounces the transport after the requested
//! delay. Anything else is logged and ignored. A disconnect is terminal
//! until operator intervention; the daemon never re-subscribes on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::{Command, CommandName, ControlMessage, EventMessage};
use crate::registry::RegistryHandle;
use crate::rpc;
use crate::transport::Transport;

/// Grace window handed to the transport on disconnect and reconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

pub struct ControlHandler {
    pub registry: RegistryHandle,
    pub transport: Arc<dyn Transport>,
    pub rpc_deadline: Duration,
}

impl ControlHandler {
    /// Consumes raw control frames until shutdown.
    pub async fn run(self, mut control_rx: mpsc::Receiver<Vec<u8>>, token: CancellationToken) {
        loop {
            let raw = tokio::select! {
                _ = token.cancelled() => break,
                msg = control_rx.recv() => match msg {
                    Some(raw) => raw,
                    None => break,
                }
            };

            let cmd: Command = match serde_json::from_slice(&raw) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(error = %e, "cannot unmarshal control message");
                    continue;
                }
            };
            debug!(message_id = %cmd.message_id, command = ?cmd.content.command, "received command");

            match cmd.content.command {
                CommandName::Ping => self.pong(&cmd).await,
                CommandName::Disconnect => self.disconnect().await,
                CommandName::Reconnect => self.reconnect(&cmd).await,
                CommandName::Unknown => {
                    warn!(message_id = %cmd.message_id, "unknown command");
                }
            }
        }
    }

    async fn pong(&self, cmd: &Command) {
        let reply = ControlMessage::Event(EventMessage::pong(cmd.message_id.clone()));
        if let Err(e) = self.transport.send_control(reply).await {
            warn!(error = %e, "cannot send pong");
        }
    }

    async fn disconnect(&self) {
        info!("disconnecting...");
        for (handler, record) in self.registry.snapshot().await {
            if let Err(e) = rpc::disconnect_worker(&record.addr, self.rpc_deadline).await {
                warn!(handler = %handler, error = %e, "cannot disconnect worker");
            }
        }
        if let Err(e) = self.transport.disconnect(DISCONNECT_GRACE).await {
            warn!(error = %e, "cannot disconnect transport");
        }
    }

    async fn reconnect(&self, cmd: &Command) {
        info!("reconnecting...");
        if let Err(e) = self.transport.disconnect(DISCONNECT_GRACE).await {
            warn!(error = %e, "cannot disconnect transport");
        }
        let delay = cmd.content.arguments.get("delay").map(String::as_str);
        let seconds: u64 = match delay.unwrap_or_default().parse() {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!(?delay, error = %e, "cannot parse reconnect delay");
                return;
            }
        };
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        if let Err(e) = self.transport.start().await {
            warn!(error = %e, "cannot reconnect transport");
        }
    }
}
