//! P2P Node implementation
//!
//! Wires the networking components together: the listener feeds accepted
//! connections to the admission controller, handshakes hand established
//! peers to the registry, and an optional port mapping supervisor keeps
//! the listen port reachable from outside. One cancellation token stops
//! all of it.

use crate::config::{ConfigError, NodeConfig};
use crate::nat::{self, MappingHandle, MappingStatus, Nat, NatError, PortMapper, PortMapping};
use crate::network::admission::{AdmissionController, AdmissionError, SlotUsage};
use crate::network::banlist::BanList;
use crate::network::handshake::HandshakeEngine;
use crate::network::listener::{Incoming, Listener, ListenerError};
use crate::network::message::{NodeId, VersionMessage};
use crate::network::peer::{connect_to_peer, PeerError, PeerSummary};
use crate::network::reactor::Reactors;
use crate::network::registry::{PeerRegistry, RegistryError, RegistryHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// How long an outbound TCP connect may take
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const MAPPING_DESCRIPTION: &str = "blockchain-service p2p";

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Nat(#[from] NatError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// =============================================================================
// Node
// =============================================================================

/// Node status information
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub peers: usize,
    pub handshake_slots: SlotUsage,
    /// NAT mechanism, or `None` when traversal is off
    pub nat: Option<String>,
    pub mapping: Option<MappingStatus>,
}

/// A running node
pub struct Node {
    node_id: NodeId,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    registry: RegistryHandle,
    admission: Arc<AdmissionController>,
    nat: Option<Arc<Nat>>,
    mapping: Option<MappingHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the listener and start every background task
    ///
    /// A bad NAT mechanism or a listen address that cannot be bound stops
    /// startup; failing to reach bootstrap peers does not.
    pub async fn start(config: NodeConfig, reactors: Reactors) -> Result<Self, NodeError> {
        config.validate()?;
        let nat = nat::parse(&config.nat)?.map(Arc::new);

        let listener = Listener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr();
        let node_id = NodeId::random();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let registry = PeerRegistry::new(
            reactors,
            config.registry_config(node_id),
            config.handoff_capacity,
        );
        let (registry, registry_task) = registry.spawn(shutdown.clone());
        tasks.push(registry_task);

        let version = VersionMessage::new(node_id, config.services(), local_addr.port())
            .with_user_agent(config.user_agent.clone());
        let engine = HandshakeEngine::new(
            version,
            config.handshake_timeout(),
            registry.sender(),
            shutdown.clone(),
        );
        let banlist = BanList::with_entries(
            config.banned.iter().copied(),
            config.whitelist.iter().copied(),
        );
        let admission = Arc::new(AdmissionController::new(
            config.max_handshakes,
            Arc::new(banlist),
            engine,
        ));

        let incoming = listener.spawn(shutdown.clone());
        tasks.push(tokio::spawn(accept_loop(incoming, admission.clone())));

        let mapping = nat.as_ref().map(|nat| {
            log::info!("NAT traversal via {}", nat);
            tasks.push(tokio::spawn(log_external_address(
                nat.clone(),
                shutdown.clone(),
            )));
            PortMapper::spawn(
                nat.clone(),
                PortMapping::tcp(local_addr.port(), MAPPING_DESCRIPTION),
            )
        });

        let dials = config
            .bootstrap_peers
            .iter()
            .map(|addr| (addr, false))
            .chain(config.persistent_peers.iter().map(|addr| (addr, true)));
        for (addr, persistent) in dials {
            let admission = admission.clone();
            let shutdown = shutdown.clone();
            let addr = addr.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = dial(&admission, &addr, persistent) => {
                        if let Err(e) = result {
                            log::warn!("Failed to connect to {}: {}", addr, e);
                        }
                    }
                }
            }));
        }

        log::info!(
            "Node {} started on {} ({} handshake slots)",
            node_id,
            local_addr,
            config.max_handshakes
        );

        Ok(Self {
            node_id,
            local_addr,
            shutdown,
            registry,
            admission,
            nat,
            mapping,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for sending to peers
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn banlist(&self) -> &Arc<BanList> {
        self.admission.banlist()
    }

    /// Dial `addr` and handshake; the peer joins the registry on success
    pub async fn connect_to(&self, addr: &str, persistent: bool) -> Result<NodeId, NodeError> {
        dial(&self.admission, addr, persistent).await
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>, NodeError> {
        Ok(self.registry.list_peers().await?)
    }

    pub fn slot_usage(&self) -> SlotUsage {
        self.admission.slot_usage()
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        Ok(NodeStatus {
            node_id: self.node_id,
            listen_addr: self.local_addr,
            peers: self.registry.peer_count().await?,
            handshake_slots: self.slot_usage(),
            nat: self.nat.as_ref().map(|nat| nat.to_string()),
            mapping: self.mapping.as_ref().map(|mapping| mapping.status()),
        })
    }

    /// Stop accepting, close every peer and delete the port mapping
    pub async fn shutdown(mut self) {
        log::info!("Node shutting down...");
        self.shutdown.cancel();
        self.admission.close();

        if let Some(mapping) = self.mapping.take() {
            mapping.stop().await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Background task failed: {}", e);
                }
            }
        }
        log::info!("Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

async fn accept_loop(mut incoming: Incoming, admission: Arc<AdmissionController>) {
    while let Some(raw) = incoming.next().await {
        admission.admit(raw).await;
    }
    log::debug!("Accept loop stopped");
}

async fn dial(
    admission: &AdmissionController,
    addr: &str,
    persistent: bool,
) -> Result<NodeId, NodeError> {
    log::info!("Connecting to peer: {}", addr);
    let raw = tokio::time::timeout(DIAL_TIMEOUT, connect_to_peer(addr))
        .await
        .map_err(|_| PeerError::ConnectionFailed(format!("connect to {} timed out", addr)))??;
    Ok(admission.admit_outbound(raw, persistent).await?)
}

async fn log_external_address(nat: Arc<Nat>, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = nat.external_address() => match result {
            Ok(ip) => log::info!("External address {} via {}", ip, nat),
            Err(e) => log::warn!("Could not determine external address: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::reactor::Reactor;
    use tokio::sync::mpsc;

    struct Inbox(mpsc::UnboundedSender<(u8, NodeId, Vec<u8>)>);

    impl Reactor for Inbox {
        fn receive(&self, channel: u8, peer: &PeerSummary, payload: &[u8]) {
            let _ = self.0.send((channel, peer.id, payload.to_vec()));
        }
    }

    fn local_config() -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    async fn wait_for_peers(node: &Node, count: usize) -> Vec<PeerSummary> {
        for _ in 0..200 {
            let peers = node.list_peers().await.unwrap();
            if peers.len() == count {
                return peers;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("node {} never reached {} peers", node.node_id(), count);
    }

    #[tokio::test]
    async fn test_two_nodes_connect() {
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
        let mut reactors = Reactors::new();
        reactors.register(1, Arc::new(Inbox(inbox_tx))).unwrap();

        let a = Node::start(local_config(), reactors).await.unwrap();
        let b = Node::start(local_config(), Reactors::new()).await.unwrap();

        let remote = b.connect_to(&a.local_addr().to_string(), false).await.unwrap();
        assert_eq!(remote, a.node_id());

        let seen_by_a = wait_for_peers(&a, 1).await;
        assert_eq!(seen_by_a[0].id, b.node_id());
        assert!(!seen_by_a[0].outbound);
        let seen_by_b = wait_for_peers(&b, 1).await;
        assert!(seen_by_b[0].outbound);

        b.registry().send_to(a.node_id(), 1, b"hello".to_vec()).await.unwrap();
        let (channel, from, payload) = inbox.recv().await.unwrap();
        assert_eq!((channel, from, payload), (1, b.node_id(), b"hello".to_vec()));

        let status = a.status().await.unwrap();
        assert_eq!(status.peers, 1);
        assert_eq!(status.handshake_slots.in_use, 0);
        assert!(status.nat.is_none());

        b.shutdown().await;
        wait_for_peers(&a, 0).await;
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_peers_dialed() {
        let a = Node::start(local_config(), Reactors::new()).await.unwrap();
        let config = NodeConfig {
            persistent_peers: vec![a.local_addr().to_string()],
            ..local_config()
        };
        let b = Node::start(config, Reactors::new()).await.unwrap();

        let peers = wait_for_peers(&b, 1).await;
        assert_eq!(peers[0].id, a.node_id());
        assert!(peers[0].persistent);

        b.shutdown().await;
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_banned_peer_refused() {
        let config = NodeConfig {
            banned: vec!["127.0.0.1".parse().unwrap()],
            ..local_config()
        };
        let a = Node::start(config, Reactors::new()).await.unwrap();
        let b = Node::start(local_config(), Reactors::new()).await.unwrap();

        let result = b.connect_to(&a.local_addr().to_string(), false).await;
        assert!(result.is_err());
        assert!(a.list_peers().await.unwrap().is_empty());

        b.shutdown().await;
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_dial_dropped() {
        let a = Node::start(local_config(), Reactors::new()).await.unwrap();

        // Both ends handshake, then the registry recognises its own id.
        let _ = a.connect_to(&a.local_addr().to_string(), false).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.list_peers().await.unwrap().is_empty());

        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_nat_mapping_reported_in_status() {
        let config = NodeConfig {
            nat: "extip:127.0.0.1".to_string(),
            ..local_config()
        };
        let node = Node::start(config, Reactors::new()).await.unwrap();

        let mut mapped = false;
        for _ in 0..100 {
            let status = node.status().await.unwrap();
            assert_eq!(status.nat.as_deref(), Some("ExtIP(127.0.0.1)"));
            if status.mapping.as_ref().is_some_and(|m| m.mapped) {
                mapped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mapped);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_failures() {
        let bad_nat = NodeConfig {
            nat: "teleport".to_string(),
            ..local_config()
        };
        let err = Node::start(bad_nat, Reactors::new()).await.err().unwrap();
        assert!(matches!(err, NodeError::Config(ConfigError::Nat(_))));

        let a = Node::start(local_config(), Reactors::new()).await.unwrap();
        let taken = NodeConfig {
            listen_addr: a.local_addr().to_string(),
            ..local_config()
        };
        let err = Node::start(taken, Reactors::new()).await.err().unwrap();
        assert!(matches!(err, NodeError::Listener(ListenerError::Bind { .. })));

        a.shutdown().await;
    }
}
