//! Wire messages exchanged with the remote plane and with workers.
//!
//! Everything on the wire is JSON. The same [`Data`] shape travels in both
//! directions: remote plane → daemon → worker, and worker → daemon → remote
//! plane. Control traffic uses [`Command`] inbound and [`EventMessage`] /
//! [`ConnectionStatus`] outbound.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminator carried in every message's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Data,
    Command,
    Event,
    ConnectionStatus,
}

/// Advertised capability map: handler name → feature mapping.
///
/// Ordered so that serialisation is deterministic and content-hashable.
pub type DispatchersMap = BTreeMap<String, BTreeMap<String, String>>;

/// A payload-bearing message, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub directive: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(with = "b64")]
    pub content: Vec<u8>,
}

impl Data {
    /// Creates a new outbound message with a fresh id.
    pub fn new(directive: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Data,
            message_id: Uuid::new_v4().to_string(),
            response_to: None,
            version: 1,
            sent: Utc::now(),
            directive: directive.into(),
            metadata: HashMap::new(),
            content,
        }
    }

    /// Creates an error reply correlated to `original`.
    pub fn error_reply(original: &Data, reason: impl AsRef<str>) -> Self {
        let mut reply = Data::new(original.directive.clone(), reason.as_ref().as_bytes().to_vec());
        reply.response_to = Some(original.message_id.clone());
        reply
            .metadata
            .insert("result".to_string(), "error".to_string());
        reply
    }
}

/// Inbound control command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub content: CommandContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandContent {
    pub command: CommandName,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    Ping,
    Disconnect,
    Reconnect,
    #[serde(other)]
    Unknown,
}

/// Outbound control event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_to: Option<String>,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub content: String,
}

impl EventMessage {
    /// Builds the pong reply to a ping command.
    pub fn pong(response_to: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Event,
            message_id: Uuid::new_v4().to_string(),
            response_to: Some(response_to.into()),
            version: 1,
            sent: Utc::now(),
            content: "pong".to_string(),
        }
    }
}

/// Capability advertisement published on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: String,
    pub version: u32,
    pub sent: DateTime<Utc>,
    pub content: StatusContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusContent {
    pub state: String,
    pub dispatchers: DispatchersMap,
}

impl ConnectionStatus {
    pub fn online(dispatchers: DispatchersMap) -> Self {
        Self {
            kind: MessageType::ConnectionStatus,
            message_id: Uuid::new_v4().to_string(),
            version: 1,
            sent: Utc::now(),
            content: StatusContent {
                state: "online".to_string(),
                dispatchers,
            },
        }
    }
}

/// Everything the daemon can publish on the control channel.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Event(EventMessage),
    Status(ConnectionStatus),
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
