//! Handshake admission control
//!
//! Sits between the listener and the handshake engine. A connection must
//! pass the ban list and then take one of a fixed number of slots before
//! its handshake starts; the slot is held by the handshake task and given
//! back when that task ends, however it ends. When all slots are taken
//! `admit` waits, which in turn stops the accept loop from pulling more
//! connections off the socket.

use crate::network::banlist::BanList;
use crate::network::handshake::{HandshakeEngine, HandshakeError};
use crate::network::message::NodeId;
use crate::network::peer::RawConnection;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent handshakes
pub const DEFAULT_MAX_HANDSHAKES: usize = 50;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Admission controller is closed")]
    Closed,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// One unit of handshake capacity, returned to the pool on drop
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

/// Slot usage for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    pub in_use: usize,
    pub capacity: usize,
}

pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
    banlist: Arc<BanList>,
    engine: HandshakeEngine,
}

impl AdmissionController {
    pub fn new(capacity: usize, banlist: Arc<BanList>, engine: HandshakeEngine) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            banlist,
            engine,
        }
    }

    pub fn banlist(&self) -> &Arc<BanList> {
        &self.banlist
    }

    pub fn slot_usage(&self) -> SlotUsage {
        SlotUsage {
            in_use: self.capacity.saturating_sub(self.slots.available_permits()),
            capacity: self.capacity,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<AdmissionSlot, AdmissionError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        Ok(AdmissionSlot { _permit: permit })
    }

    /// Admit an inbound connection
    ///
    /// Returns `false` when the remote is banned (the connection is closed
    /// and no slot is used) or the controller has been closed. Otherwise
    /// waits for a slot and starts the handshake on its own task.
    pub async fn admit(&self, raw: RawConnection) -> bool {
        let addr = raw.remote_addr();

        if !self.banlist.is_allowed(&addr.ip()).await {
            log::info!("Connection from {} dropped (banned)", addr);
            raw.close();
            return false;
        }

        let slot = match self.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                log::debug!("Dropping {}: {}", addr, e);
                raw.close();
                return false;
            }
        };

        let engine = self.engine.clone();
        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = engine.run(raw, false, false).await {
                log::warn!(
                    "Ignoring inbound connection from {}: {}",
                    addr,
                    e
                );
            }
        });
        true
    }

    /// Handshake a connection we dialed, holding a slot for its duration
    pub async fn admit_outbound(
        &self,
        raw: RawConnection,
        persistent: bool,
    ) -> Result<NodeId, AdmissionError> {
        let _slot = self.acquire().await?;
        Ok(self.engine.run(raw, true, persistent).await?)
    }

    /// Stop admitting; callers waiting for a slot give up
    pub fn close(&self) {
        self.slots.close();
    }
}
