//! Live peer set and message dispatch
//!
//! A single task owns the map of live peers. Everything that touches it
//! (new peers from the handshake engine, disconnects reported by reader
//! tasks, control-plane queries, outbound sends) arrives as a
//! [`RegistryEvent`] on one queue and is handled in order. Handlers never
//! await, so the task cannot stall on its own queue.

use crate::network::message::{Message, NodeId};
use crate::network::peer::{PeerConnection, PeerSummary, PeerTransport};
use crate::network::reactor::Reactors;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Default capacity of the handshake → registry queue
pub const DEFAULT_HANDOFF_CAPACITY: usize = 16;

/// Outbound messages buffered per peer
pub const PEER_SEND_QUEUE: usize = 100;

/// Default maximum number of live peers
pub const DEFAULT_MAX_PEERS: usize = 125;

/// How often an idle writer pings its peer
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Silence after which a peer is considered dead
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Channel {0} already has a reactor")]
    DuplicateChannel(u8),
    #[error("Unknown peer {0}")]
    UnknownPeer(NodeId),
    #[error("Send queue for peer {0} is full")]
    QueueFull(NodeId),
    #[error("Peer registry has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Our own identity; peers announcing it are self-connections
    pub local_id: Option<NodeId>,
    /// Live peer limit; persistent peers are let in regardless
    pub max_peers: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            local_id: None,
            max_peers: DEFAULT_MAX_PEERS,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Everything the registry task reacts to
#[derive(Debug)]
pub enum RegistryEvent {
    /// A handshake succeeded
    Established(PeerConnection),
    /// A peer sent an application message
    Inbound {
        peer: NodeId,
        channel: u8,
        payload: Vec<u8>,
    },
    /// A peer's reader stopped; `session` tells reconnects apart
    Disconnected {
        peer: NodeId,
        session: u64,
        reason: String,
    },
    ListPeers(oneshot::Sender<Vec<PeerSummary>>),
    Send {
        peer: NodeId,
        channel: u8,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Broadcast {
        channel: u8,
        payload: Vec<u8>,
    },
    /// Evict a peer
    Disconnect {
        peer: NodeId,
        reply: oneshot::Sender<bool>,
    },
}

// =============================================================================
// Registry
// =============================================================================

struct LivePeer {
    summary: PeerSummary,
    session: u64,
    tx: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LivePeer {
    fn stop(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Owner of the live peer set
pub struct PeerRegistry {
    reactors: Reactors,
    config: RegistryConfig,
    peers: HashMap<NodeId, LivePeer>,
    next_session: u64,
    tx: mpsc::Sender<RegistryEvent>,
    rx: mpsc::Receiver<RegistryEvent>,
}

impl PeerRegistry {
    pub fn new(reactors: Reactors, config: RegistryConfig, handoff_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(handoff_capacity.max(1));
        Self {
            reactors,
            config,
            peers: HashMap::new(),
            next_session: 0,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run the dispatch loop on its own task
    pub fn spawn(self, shutdown: CancellationToken) -> (RegistryHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run(shutdown)))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        log::debug!(
            "Dispatching for channels {:?}",
            self.reactors.channels()
        );

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event);
        }

        let live: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in live {
            self.remove(&id, "shutting down");
        }
        log::debug!("Peer registry stopped");
    }

    fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Established(conn) => self.register(conn),
            RegistryEvent::Inbound {
                peer,
                channel,
                payload,
            } => self.dispatch(&peer, channel, &payload),
            RegistryEvent::Disconnected {
                peer,
                session,
                reason,
            } => {
                if self.peers.get(&peer).is_some_and(|p| p.session == session) {
                    self.remove(&peer, &reason);
                }
            }
            RegistryEvent::ListPeers(reply) => {
                let _ = reply.send(self.summaries());
            }
            RegistryEvent::Send {
                peer,
                channel,
                payload,
                reply,
            } => {
                let _ = reply.send(self.send_to(&peer, Message::Envelope { channel, payload }));
            }
            RegistryEvent::Broadcast { channel, payload } => self.broadcast(channel, payload),
            RegistryEvent::Disconnect { peer, reply } => {
                let _ = reply.send(self.remove(&peer, "disconnected by request"));
            }
        }
    }

    fn register(&mut self, conn: PeerConnection) {
        let Some(summary) = conn.summary() else {
            log::warn!(
                "Dropping {} without a completed handshake",
                conn.remote_addr()
            );
            conn.close();
            return;
        };
        let id = summary.id;

        if self.config.local_id == Some(id) {
            log::info!("Dropping self-connection via {}", summary.addr);
            conn.close();
            return;
        }
        if self.peers.contains_key(&id) {
            log::info!(
                "Dropping duplicate connection to {} from {}",
                id,
                summary.addr
            );
            conn.close();
            return;
        }
        if self.peers.len() >= self.config.max_peers && !summary.persistent {
            log::info!(
                "Max peers reached, dropping {} ({})",
                id,
                summary.addr
            );
            conn.close();
            return;
        }

        let session = self.next_session;
        self.next_session += 1;

        let (sink, stream) = conn.into_transport().split();
        let (tx, rx) = mpsc::channel::<Message>(PEER_SEND_QUEUE);

        let writer = tokio::spawn(write_loop(id, sink, rx, self.config.ping_interval));
        let reader = tokio::spawn(read_loop(
            id,
            session,
            stream,
            tx.clone(),
            self.tx.clone(),
            self.config.idle_timeout,
        ));

        log::info!(
            "Added peer {} at {} (outbound: {})",
            id,
            summary.addr,
            summary.outbound
        );
        for reactor in self.reactors.distinct() {
            reactor.peer_added(&summary);
        }

        self.peers.insert(
            id,
            LivePeer {
                summary,
                session,
                tx,
                reader,
                writer,
            },
        );
    }

    fn remove(&mut self, id: &NodeId, reason: &str) -> bool {
        let Some(peer) = self.peers.remove(id) else {
            return false;
        };
        peer.stop();

        log::info!(
            "Removed peer {} at {}: {}",
            id,
            peer.summary.addr,
            reason
        );
        for reactor in self.reactors.distinct() {
            reactor.peer_removed(&peer.summary);
        }
        true
    }

    fn dispatch(&self, id: &NodeId, channel: u8, payload: &[u8]) {
        // The peer may have gone between reading and dispatch.
        let Some(peer) = self.peers.get(id) else {
            return;
        };

        match self.reactors.get(channel) {
            Some(reactor) => reactor.receive(channel, &peer.summary, payload),
            None => log::warn!(
                "No reactor for channel {}, dropping {} bytes from {}",
                channel,
                payload.len(),
                id
            ),
        }
    }

    fn send_to(&self, id: &NodeId, msg: Message) -> Result<(), RegistryError> {
        let peer = self.peers.get(id).ok_or(RegistryError::UnknownPeer(*id))?;
        peer.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::QueueFull(*id),
            mpsc::error::TrySendError::Closed(_) => RegistryError::UnknownPeer(*id),
        })
    }

    fn broadcast(&self, channel: u8, payload: Vec<u8>) {
        for (id, peer) in &self.peers {
            let msg = Message::Envelope {
                channel,
                payload: payload.clone(),
            };
            if let Err(e) = peer.tx.try_send(msg) {
                log::warn!("Failed to send to {}: {}", id, e);
            }
        }
    }

    fn summaries(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.peers.values().map(|p| p.summary.clone()).collect();
        peers.sort_by_key(|p| p.id);
        peers
    }
}

// =============================================================================
// Peer Tasks
// =============================================================================

async fn read_loop(
    id: NodeId,
    session: u64,
    mut stream: SplitStream<PeerTransport>,
    peer_tx: mpsc::Sender<Message>,
    events: mpsc::Sender<RegistryEvent>,
    idle_timeout: Duration,
) {
    let reason = loop {
        let next = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => break "idle timeout".to_string(),
        };

        match next {
            None => break "closed by peer".to_string(),
            Some(Err(e)) => break format!("read error: {}", e),
            Some(Ok(Message::Envelope { channel, payload })) => {
                let event = RegistryEvent::Inbound {
                    peer: id,
                    channel,
                    payload,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Ping(nonce))) => {
                let _ = peer_tx.try_send(Message::Pong(nonce));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(other)) => log::debug!(
                "Ignoring {} from {} after handshake",
                other.type_name(),
                id
            ),
        }
    };

    let _ = events
        .send(RegistryEvent::Disconnected {
            peer: id,
            session,
            reason,
        })
        .await;
}

async fn write_loop(
    id: NodeId,
    mut sink: SplitSink<PeerTransport, Message>,
    mut rx: mpsc::Receiver<Message>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = ping.tick() => Message::Ping(rand::random()),
        };

        if let Err(e) = sink.send(msg).await {
            log::debug!("Write to {} failed: {}", id, e);
            break;
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable access to a running registry
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryEvent>,
}

impl RegistryHandle {
    /// Queue the handshake engine delivers established peers to
    pub fn sender(&self) -> mpsc::Sender<RegistryEvent> {
        self.tx.clone()
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryEvent::ListPeers(reply), rx).await
    }

    pub async fn peer_count(&self) -> Result<usize, RegistryError> {
        Ok(self.list_peers().await?.len())
    }

    pub async fn send_to(
        &self,
        peer: NodeId,
        channel: u8,
        payload: Vec<u8>,
    ) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        let event = RegistryEvent::Send {
            peer,
            channel,
            payload,
            reply,
        };
        self.request(event, rx).await?
    }

    pub async fn broadcast(&self, channel: u8, payload: Vec<u8>) -> Result<(), RegistryError> {
        self.tx
            .send(RegistryEvent::Broadcast { channel, payload })
            .await
            .map_err(|_| RegistryError::Stopped)
    }

    /// Evict a peer; `false` if it was not live
    pub async fn disconnect(&self, peer: NodeId) -> Result<bool, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryEvent::Disconnect { peer, reply }, rx).await
    }

    async fn request<T>(
        &self,
        event: RegistryEvent,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, RegistryError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RegistryError::Stopped)?;
        rx.await.map_err(|_| RegistryError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handshake::{HandshakeEngine, DEFAULT_HANDSHAKE_TIMEOUT};
    use crate::network::message::{ServiceFlags, VersionMessage};
    use crate::network::peer::RawConnection;
    use crate::network::reactor::Reactor;
    use std::net::SocketAddr;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Added(NodeId),
        Removed(NodeId),
        Message(u8, NodeId, Vec<u8>),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    impl Reactor for Recorder {
        fn receive(&self, channel: u8, peer: &PeerSummary, payload: &[u8]) {
            let _ = self.0.send(Seen::Message(channel, peer.id, payload.to_vec()));
        }

        fn peer_added(&self, peer: &PeerSummary) {
            let _ = self.0.send(Seen::Added(peer.id));
        }

        fn peer_removed(&self, peer: &PeerSummary) {
            let _ = self.0.send(Seen::Removed(peer.id));
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:18444".parse().unwrap()
    }

    fn remote_engine() -> HandshakeEngine {
        let version = VersionMessage::new(NodeId::random(), ServiceFlags::default(), 18444);
        let (unused, _) = mpsc::channel(1);
        HandshakeEngine::new(version, DEFAULT_HANDSHAKE_TIMEOUT, unused, CancellationToken::new())
    }

    fn start(config: RegistryConfig) -> (RegistryHandle, mpsc::UnboundedReceiver<Seen>, CancellationToken, JoinHandle<()>) {
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let mut reactors = Reactors::new();
        reactors.register(1, Arc::new(Recorder(seen_tx))).unwrap();

        let shutdown = CancellationToken::new();
        let (handle, task) = PeerRegistry::new(reactors, config, 4).spawn(shutdown.clone());
        (handle, seen, shutdown, task)
    }

    /// Handshake a fresh in-memory connection into the registry and return
    /// the remote end's transport.
    async fn connect(handle: &RegistryHandle, remote: &HandshakeEngine) -> PeerTransport {
        let version = VersionMessage::new(NodeId::random(), ServiceFlags::default(), 8333);
        let local = HandshakeEngine::new(
            version,
            DEFAULT_HANDSHAKE_TIMEOUT,
            handle.sender(),
            CancellationToken::new(),
        );

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (delivered, remote_peer) = tokio::join!(
            local.run(RawConnection::new(a, addr()), false, false),
            remote.handshake(RawConnection::new(b, addr()), true, false),
        );
        delivered.unwrap();
        remote_peer.unwrap().into_transport()
    }

    #[tokio::test]
    async fn test_dispatch_by_channel() {
        let (handle, mut seen, _shutdown, _task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        let mut transport = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));

        // Unregistered channel is dropped without harming the registry.
        transport
            .send(Message::Envelope { channel: 9, payload: vec![9] })
            .await
            .unwrap();
        transport
            .send(Message::Envelope { channel: 1, payload: vec![1, 2] })
            .await
            .unwrap();

        assert_eq!(seen.recv().await, Some(Seen::Message(1, remote_id, vec![1, 2])));
        assert_eq!(handle.peer_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_removed_exactly_once_on_close() {
        let (handle, mut seen, _shutdown, _task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        let transport = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));

        drop(transport);
        assert_eq!(seen.recv().await, Some(Seen::Removed(remote_id)));
        assert_eq!(handle.peer_count().await.unwrap(), 0);

        let again = tokio::time::timeout(Duration::from_millis(100), seen.recv()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_send_to_peer() {
        let (handle, mut seen, _shutdown, _task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        let mut transport = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));

        handle.send_to(remote_id, 3, vec![7, 7]).await.unwrap();
        let received = transport.next().await.unwrap().unwrap();
        assert_eq!(received, Message::Envelope { channel: 3, payload: vec![7, 7] });

        handle.broadcast(4, vec![1]).await.unwrap();
        let received = transport.next().await.unwrap().unwrap();
        assert_eq!(received, Message::Envelope { channel: 4, payload: vec![1] });

        let unknown = handle.send_to(NodeId::random(), 3, vec![]).await;
        assert!(matches!(unknown, Err(RegistryError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let (handle, mut seen, _shutdown, _task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        let _first = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));

        let mut second = connect(&handle, &remote).await;
        assert!(second.next().await.is_none());
        assert_eq!(handle.peer_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let remote = remote_engine();
        let config = RegistryConfig {
            local_id: Some(remote.local_version().node_id),
            ..Default::default()
        };
        let (handle, _seen, _shutdown, _task) = start(config);

        let mut transport = connect(&handle, &remote).await;
        assert!(transport.next().await.is_none());
        assert_eq!(handle.peer_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_max_peers() {
        let config = RegistryConfig {
            max_peers: 1,
            ..Default::default()
        };
        let (handle, _seen, _shutdown, _task) = start(config);

        let _first = connect(&handle, &remote_engine()).await;
        let mut second = connect(&handle, &remote_engine()).await;
        assert!(second.next().await.is_none());
        assert_eq!(handle.peer_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_evicts() {
        let (handle, mut seen, _shutdown, _task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        let mut transport = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));

        assert!(handle.disconnect(remote_id).await.unwrap());
        assert_eq!(seen.recv().await, Some(Seen::Removed(remote_id)));
        assert!(!handle.disconnect(remote_id).await.unwrap());
        assert!(transport.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (handle, mut seen, _shutdown, _task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        // Held open but never read from or written to.
        let _transport = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));
        assert_eq!(seen.recv().await, Some(Seen::Removed(remote_id)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_peers() {
        let (handle, mut seen, shutdown, task) = start(RegistryConfig::default());
        let remote = remote_engine();
        let remote_id = remote.local_version().node_id;

        let mut transport = connect(&handle, &remote).await;
        assert_eq!(seen.recv().await, Some(Seen::Added(remote_id)));

        shutdown.cancel();
        task.await.unwrap();
        assert!(transport.next().await.is_none());
        assert!(matches!(handle.list_peers().await, Err(RegistryError::Stopped)));
    }
}
