//! TCP listener and accept loop
//!
//! Accepts incoming peer connections and publishes them on a bounded
//! channel. The channel holds a single connection, so the accept loop never
//! gets ahead of whoever is draining it.

use crate::network::peer::RawConnection;
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Too many open files (process / system wide)
#[cfg(unix)]
const DESCRIPTOR_EXHAUSTION: [i32; 2] = [24, 23];

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Whether an accept error is worth retrying
pub fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        WouldBlock | Interrupted | ConnectionAborted | ConnectionReset | ConnectionRefused | TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return DESCRIPTOR_EXHAUSTION.contains(&code);
    }

    false
}

// =============================================================================
// Accept Source
// =============================================================================

/// Something that hands out inbound connections one at a time
pub trait Accept: Send + 'static {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<RawConnection>>;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<RawConnection>> {
        async move {
            let (stream, addr) = TcpListener::accept(self).await?;
            Ok(RawConnection::new(stream, addr))
        }
        .boxed()
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Bound transport socket, not yet accepting
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `addr` (`host:port`). Failure is reported, never retried.
    pub async fn bind(addr: &str) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ListenerError::LocalAddr)?;
        log::info!("Listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop on its own task
    pub fn spawn(self, shutdown: CancellationToken) -> Incoming {
        Incoming::spawn(self.listener, shutdown)
    }
}

async fn accept_loop<A: Accept>(
    mut source: A,
    tx: mpsc::Sender<RawConnection>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                log::debug!("Accept loop stopped");
                return;
            }
            _ = tx.closed() => {
                log::debug!("Connection consumer went away");
                return;
            }
            accepted = source.accept() => accepted,
        };

        match accepted {
            Ok(raw) => {
                log::debug!("Incoming connection from {}", raw.remote_addr());
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(raw) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) if is_transient(&e) => {
                log::debug!("Temporary accept error: {}", e);
                tokio::task::yield_now().await;
            }
            Err(e) => {
                log::error!("Accept error, closing listener: {}", e);
                return;
            }
        }
    }
}

// =============================================================================
// Incoming
// =============================================================================

/// Stream of accepted connections
///
/// Yields `None` once the accept loop has stopped, whether from shutdown or
/// a fatal accept error.
pub struct Incoming {
    rx: mpsc::Receiver<RawConnection>,
    task: JoinHandle<()>,
}

impl Incoming {
    /// Run the accept loop over any connection source
    pub fn spawn<A: Accept>(source: A, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(accept_loop(source, tx, shutdown));
        Self { rx, task }
    }

    pub async fn next(&mut self) -> Option<RawConnection> {
        self.rx.recv().await
    }

    /// Whether the accept loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        self.task.abort();
    }
}
