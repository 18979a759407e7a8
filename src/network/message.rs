//! Network message types for peer communication
//!
//! Only the handshake is interpreted by this crate. Everything an
//! application sends rides in an opaque [`Message::Envelope`] tagged with
//! the channel that selects its reactor.

use bitflags::bitflags;
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x42, 0x53, 0x56, 0x43]; // "BSVC"

/// Largest frame body the codec accepts (4 MiB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

bitflags! {
    /// Services a node advertises in its version message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        /// Serves the full chain
        const NETWORK = 1 << 0;
        /// Relays transactions
        const RELAY = 1 << 1;
        /// Serves a pruned chain only
        const PRUNED = 1 << 2;
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::NETWORK | ServiceFlags::RELAY
    }
}

/// Node identity exchanged during the handshake
///
/// Serialized as a 32-character hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Generate a fresh random identity
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| "node id must be 16 bytes".to_string())?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Version message exchanged before a connection is trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Protocol version
    pub version: u32,
    /// Sender's node identity
    pub node_id: NodeId,
    /// Raw service capability bits, see [`ServiceFlags`]
    pub services: u64,
    /// Sender's listening port (for incoming connections)
    pub listen_port: u16,
    /// Sender's user agent string
    pub user_agent: String,
    /// Unix timestamp (seconds) at which the message was built
    pub timestamp: i64,
}

impl VersionMessage {
    /// Create a version message for the local node
    pub fn new(node_id: NodeId, services: ServiceFlags, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            node_id,
            services: services.bits(),
            listen_port,
            user_agent: format!("blockchain-service/{}", env!("CARGO_PKG_VERSION")),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Override the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Decoded service flags; unknown bits are ignored
    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_bits_truncate(self.services)
    }

    /// Same message with a fresh timestamp
    pub fn refreshed(&self) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            ..self.clone()
        }
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Initial version exchange
    Version(VersionMessage),

    /// Application payload for the reactor registered on `channel`
    Envelope { channel: u8, payload: Vec<u8> },

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version(_) => "Version",
            Message::Envelope { .. } => "Envelope",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }
}
