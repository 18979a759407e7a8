//! Peer connections and their lifecycle
//!
//! A [`RawConnection`] is whatever the listener accepted or the dialer
//! opened. The handshake engine wraps it into a [`PeerConnection`] and
//! walks it through [`PeerState`] until it is either established and handed
//! to the registry, or failed and closed.

use crate::network::codec::MessageCodec;
use crate::network::message::{NodeId, VersionMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Byte stream a peer connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased transport stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Framed message transport over a peer's stream
pub type PeerTransport = Framed<BoxedStream, MessageCodec>;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: PeerState, to: PeerState },
}

/// An open byte stream with a known remote address
///
/// Dropping it closes the underlying transport, so whoever owns it last
/// closes it.
pub struct RawConnection {
    stream: BoxedStream,
    remote_addr: SocketAddr,
}

impl RawConnection {
    pub fn new<S: AsyncStream + 'static>(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            stream: Box::new(stream),
            remote_addr,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Close the connection now
    pub fn close(self) {
        log::trace!("Closing raw connection to {}", self.remote_addr);
    }

    fn into_transport(self) -> (PeerTransport, SocketAddr) {
        (Framed::new(self.stream, MessageCodec), self.remote_addr)
    }
}

impl From<(TcpStream, SocketAddr)> for RawConnection {
    fn from((stream, addr): (TcpStream, SocketAddr)) -> Self {
        Self::new(stream, addr)
    }
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Established,
    Failed,
    Closed,
}

impl PeerState {
    /// Whether `self -> next` is a legal forward move
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Connecting, Failed)
                | (Handshaking, Established)
                | (Handshaking, Failed)
                | (Established, Closed)
                | (Failed, Closed)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of a live peer, for reactors and introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub outbound: bool,
    pub persistent: bool,
    pub protocol_version: u32,
    pub services: u64,
    pub listen_port: u16,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
}

/// A connection going through (or past) the handshake
pub struct PeerConnection {
    transport: PeerTransport,
    remote_addr: SocketAddr,
    outbound: bool,
    persistent: bool,
    state: PeerState,
    remote_version: Option<VersionMessage>,
    established_at: Option<DateTime<Utc>>,
}

impl PeerConnection {
    pub fn new(raw: RawConnection, outbound: bool, persistent: bool) -> Self {
        let (transport, remote_addr) = raw.into_transport();
        Self {
            transport,
            remote_addr,
            outbound,
            persistent,
            state: PeerState::Connecting,
            remote_version: None,
            established_at: None,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn remote_version(&self) -> Option<&VersionMessage> {
        self.remote_version.as_ref()
    }

    /// Identity announced by the remote, once its version is known
    pub fn id(&self) -> Option<NodeId> {
        self.remote_version.as_ref().map(|v| v.node_id)
    }

    /// Move to `next`, rejecting backwards or sideways moves
    pub fn transition(&mut self, next: PeerState) -> Result<(), PeerError> {
        if !self.state.can_transition_to(next) {
            return Err(PeerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::trace!("{}: {} -> {}", self.remote_addr, self.state, next);
        self.state = next;
        if next == PeerState::Established {
            self.established_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn record_remote_version(&mut self, version: VersionMessage) {
        self.remote_version = Some(version);
    }

    pub(crate) fn transport_mut(&mut self) -> &mut PeerTransport {
        &mut self.transport
    }

    /// Summary of an established peer
    pub fn summary(&self) -> Option<PeerSummary> {
        let version = self.remote_version.as_ref()?;
        Some(PeerSummary {
            id: version.node_id,
            addr: self.remote_addr,
            outbound: self.outbound,
            persistent: self.persistent,
            protocol_version: version.version,
            services: version.services,
            listen_port: version.listen_port,
            user_agent: version.user_agent.clone(),
            connected_at: self.established_at.unwrap_or_else(Utc::now),
        })
    }

    /// Hand the transport over to the registry's reader/writer tasks
    pub(crate) fn into_transport(self) -> PeerTransport {
        self.transport
    }

    /// Close the connection, marking it `Closed` where that is legal
    pub fn close(mut self) {
        if self.state.can_transition_to(PeerState::Closed) {
            self.state = PeerState::Closed;
        }
        log::debug!("Closed connection to {} ({})", self.remote_addr, self.state);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("persistent", &self.persistent)
            .field("state", &self.state)
            .field("remote_version", &self.remote_version)
            .finish_non_exhaustive()
    }
}

/// Open an outbound transport connection
pub async fn connect_to_peer(addr: &str) -> Result<RawConnection, PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok(RawConnection::new(stream, peer_addr))
}
