//! P2P Networking module
//!
//! Peer connections for the node: everything between an accepted socket
//! and an established, dispatching peer.
//!
//! # Features
//! - TCP listener with transient-error tolerant accept loop
//! - Ban list and bounded handshake admission
//! - Version handshake under a deadline
//! - Length-prefixed JSON framing
//! - Single-task peer registry with per-channel reactors
//! - Keepalive pings and idle eviction

pub mod admission;
pub mod banlist;
pub mod codec;
pub mod handshake;
pub mod listener;
pub mod message;
pub mod node;
pub mod peer;
pub mod reactor;
pub mod registry;

pub use admission::{AdmissionController, AdmissionError, SlotUsage, DEFAULT_MAX_HANDSHAKES};
pub use banlist::{BanEntry, BanList, DEFAULT_BAN_DURATION};
pub use codec::MessageCodec;
pub use handshake::{HandshakeEngine, HandshakeError, DEFAULT_HANDSHAKE_TIMEOUT};
pub use listener::{Incoming, Listener, ListenerError};
pub use message::{
    Message, NodeId, ServiceFlags, VersionMessage, MAGIC, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use node::{Node, NodeError, NodeStatus};
pub use peer::{connect_to_peer, PeerConnection, PeerError, PeerState, PeerSummary, RawConnection};
pub use reactor::{Reactor, Reactors};
pub use registry::{PeerRegistry, RegistryConfig, RegistryError, RegistryEvent, RegistryHandle};
