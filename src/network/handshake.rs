//! Version handshake
//!
//! Runs the version exchange on a fresh connection under a deadline. The
//! side that dialed writes its version first and the side that accepted
//! reads first, so the two ends never wait on each other's write.
//!
//! Failures are contained here: the connection is closed and the error is
//! returned to the caller for logging. Successful peers go to the registry
//! over a bounded queue; a full queue blocks the handshake task rather than
//! dropping the peer.

use crate::network::message::{Message, NodeId, VersionMessage};
use crate::network::peer::{PeerConnection, PeerError, PeerState, PeerTransport, RawConnection};
use crate::network::registry::RegistryEvent;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default handshake deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake with {0} timed out")]
    Timeout(SocketAddr),
    #[error("IO error during handshake with {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Unexpected {got} message from {addr} during handshake")]
    Protocol { addr: SocketAddr, got: &'static str },
    #[error("Connection to {0} closed during handshake")]
    Closed(SocketAddr),
    #[error("Handshake with {0} cancelled by shutdown")]
    Cancelled(SocketAddr),
    #[error("Peer registry is not accepting peers")]
    RegistryClosed,
    #[error(transparent)]
    State(#[from] PeerError),
}

/// Performs handshakes and hands established peers to the registry
#[derive(Clone)]
pub struct HandshakeEngine {
    local: VersionMessage,
    timeout: Duration,
    handoff: mpsc::Sender<RegistryEvent>,
    shutdown: CancellationToken,
}

impl HandshakeEngine {
    pub fn new(
        local: VersionMessage,
        timeout: Duration,
        handoff: mpsc::Sender<RegistryEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            local,
            timeout,
            handoff,
            shutdown,
        }
    }

    pub fn local_version(&self) -> &VersionMessage {
        &self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handshake `raw` and deliver the resulting peer to the registry
    pub async fn run(
        &self,
        raw: RawConnection,
        outbound: bool,
        persistent: bool,
    ) -> Result<NodeId, HandshakeError> {
        let peer = self.handshake(raw, outbound, persistent).await?;
        let id = peer.id().ok_or(HandshakeError::Closed(peer.remote_addr()))?;

        self.handoff
            .send(RegistryEvent::Established(peer))
            .await
            .map_err(|_| HandshakeError::RegistryClosed)?;
        Ok(id)
    }

    /// Run the version exchange, returning an `Established` peer
    ///
    /// On failure the connection is already closed.
    pub async fn handshake(
        &self,
        raw: RawConnection,
        outbound: bool,
        persistent: bool,
    ) -> Result<PeerConnection, HandshakeError> {
        let addr = raw.remote_addr();
        let mut peer = PeerConnection::new(raw, outbound, persistent);
        peer.transition(PeerState::Handshaking)?;

        let local = self.local.refreshed();
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(HandshakeError::Cancelled(addr)),
            exchanged = tokio::time::timeout(self.timeout, exchange_versions(&mut peer, &local)) => {
                exchanged.unwrap_or(Err(HandshakeError::Timeout(addr)))
            }
        };

        match result {
            Ok(remote) => {
                log::info!(
                    "Handshake with {} complete: id={}, version={}, agent={}",
                    addr,
                    remote.node_id,
                    remote.version,
                    remote.user_agent
                );
                peer.record_remote_version(remote);
                peer.transition(PeerState::Established)?;
                Ok(peer)
            }
            Err(e) => {
                peer.transition(PeerState::Failed)?;
                peer.close();
                Err(e)
            }
        }
    }
}

// =============================================================================
// Version Exchange
// =============================================================================

async fn exchange_versions(
    peer: &mut PeerConnection,
    local: &VersionMessage,
) -> Result<VersionMessage, HandshakeError> {
    let addr = peer.remote_addr();
    let outbound = peer.is_outbound();
    let transport = peer.transport_mut();

    if outbound {
        send_version(transport, local, addr).await?;
        read_version(transport, addr).await
    } else {
        let remote = read_version(transport, addr).await?;
        send_version(transport, local, addr).await?;
        Ok(remote)
    }
}

async fn send_version(
    transport: &mut PeerTransport,
    local: &VersionMessage,
    addr: SocketAddr,
) -> Result<(), HandshakeError> {
    transport
        .send(Message::Version(local.clone()))
        .await
        .map_err(|source| HandshakeError::Io { addr, source })?;
    log::debug!("Sent version to {}", addr);
    Ok(())
}

async fn read_version(
    transport: &mut PeerTransport,
    addr: SocketAddr,
) -> Result<VersionMessage, HandshakeError> {
    match transport.next().await {
        Some(Ok(Message::Version(version))) => Ok(version),
        Some(Ok(other)) => Err(HandshakeError::Protocol {
            addr,
            got: other.type_name(),
        }),
        Some(Err(source)) => Err(HandshakeError::Io { addr, source }),
        None => Err(HandshakeError::Closed(addr)),
    }
}
