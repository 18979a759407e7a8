//! Blockchain Service: the peer-connection layer of a blockchain node
//!
//! This crate accepts and dials peers, admits them through a bounded
//! handshake stage and keeps the established ones in a registry that
//! routes application messages to per-channel reactors. It can also make
//! the node reachable from outside a NAT:
//! - TCP listener that survives transient accept errors
//! - Ban list and handshake slot pool
//! - Version handshake with deadline and shutdown cancellation
//! - UPnP, NAT-PMP or a fixed external address, with lease renewal
//!
//! # Example
//!
//! ```no_run
//! use blockchain_service::config::NodeConfig;
//! use blockchain_service::network::{Node, Reactors};
//!
//! # async fn run() -> Result<(), blockchain_service::network::NodeError> {
//! let config = NodeConfig {
//!     listen_addr: "0.0.0.0:8333".to_string(),
//!     nat: "any".to_string(),
//!     ..Default::default()
//! };
//! let node = Node::start(config, Reactors::new()).await?;
//! println!("Listening on {}", node.local_addr());
//!
//! for peer in node.list_peers().await? {
//!     println!("{} {}", peer.id, peer.addr);
//! }
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod nat;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use nat::{Nat, NatError, PortMapping, Protocol};
pub use network::{Node, NodeError, NodeStatus, Reactor, Reactors};
