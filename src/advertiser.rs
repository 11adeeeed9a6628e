//! Advertisement engine.
//!
//! Consumes tokens from the `dispatchers` channel. Each token means "the
//! advertised state may have changed": the engine snapshots the registry,
//! merges the on-disk tags into every handler's feature map, hashes the
//! deterministic serialisation, and publishes a connection-status message
//! only when the digest differs from the last published one. A burst of
//! registrations therefore produces one advertisement, not one per worker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::event::{Event, EventKind};
use crate::message::{ConnectionStatus, ControlMessage};
use crate::registry::RegistryHandle;
use crate::transport::Transport;

pub struct Advertiser {
    pub registry: RegistryHandle,
    pub transport: Arc<dyn Transport>,
    pub tags_file: PathBuf,
    pub bus: Bus,
}

impl Advertiser {
    /// Consumes `dispatchers` tokens until shutdown.
    pub async fn run(self, mut tokens: mpsc::Receiver<()>, token: CancellationToken) {
        let mut last_digest: Option<[u8; 32]> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                t = tokens.recv() => match t {
                    Some(()) => self.advertise(&mut last_digest).await,
                    None => break,
                }
            }
        }
    }

    async fn advertise(&self, last_digest: &mut Option<[u8; 32]>) {
        let mut map = self.registry.dispatchers_map().await;

        let tags = read_tags(&self.tags_file);
        if !tags.is_empty() {
            for features in map.values_mut() {
                for (k, v) in &tags {
                    features.insert(k.clone(), v.clone());
                }
            }
        }

        let bytes = match serde_json::to_vec(&map) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot serialise dispatchers map");
                return;
            }
        };
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        if *last_digest == Some(digest) {
            debug!("dispatchers map unchanged, skipping advertisement");
            return;
        }
        *last_digest = Some(digest);

        match self
            .transport
            .send_control(ControlMessage::Status(ConnectionStatus::online(map)))
            .await
        {
            Ok(()) => self.bus.publish(Event::now(EventKind::StatusPublished)),
            Err(e) => warn!(error = %e, "cannot publish connection status"),
        }
    }
}

/// Flat scalar view of the tags file; missing or malformed files read empty.
fn read_tags(path: &std::path::Path) -> BTreeMap<String, String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    let Ok(table) = raw.parse::<toml::Table>() else {
        warn!(file = %path.display(), "cannot parse tags file");
        return BTreeMap::new();
    };
    table
        .into_iter()
        .filter_map(|(k, v)| {
            let v = match v {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => return None,
            };
            Some((k, v))
        })
        .collect()
}
