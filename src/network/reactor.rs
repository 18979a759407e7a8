//! Per-channel message handlers

use crate::network::peer::PeerSummary;
use crate::network::registry::RegistryError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handler for application messages arriving on one or more channels
///
/// Called from the registry's dispatch task, so implementations should
/// hand heavy work off to their own tasks instead of blocking.
pub trait Reactor: Send + Sync {
    /// A peer sent `payload` on `channel`
    fn receive(&self, channel: u8, peer: &PeerSummary, payload: &[u8]);

    /// A peer finished its handshake and joined the live set
    fn peer_added(&self, _peer: &PeerSummary) {}

    /// A peer left the live set
    fn peer_removed(&self, _peer: &PeerSummary) {}
}

/// Channel → reactor table
#[derive(Clone, Default)]
pub struct Reactors {
    handlers: HashMap<u8, Arc<dyn Reactor>>,
}

impl Reactors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reactor` for `channel`. Each channel takes one reactor.
    pub fn register(&mut self, channel: u8, reactor: Arc<dyn Reactor>) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&channel) {
            return Err(RegistryError::DuplicateChannel(channel));
        }
        self.handlers.insert(channel, reactor);
        Ok(())
    }

    pub fn get(&self, channel: u8) -> Option<&Arc<dyn Reactor>> {
        self.handlers.get(&channel)
    }

    /// Registered channels in ascending order
    pub fn channels(&self) -> Vec<u8> {
        let mut channels: Vec<u8> = self.handlers.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Each registered reactor once, even if it serves several channels
    pub(crate) fn distinct(&self) -> Vec<&Arc<dyn Reactor>> {
        let mut seen: Vec<&Arc<dyn Reactor>> = Vec::new();
        for reactor in self.handlers.values() {
            if !seen.iter().any(|r| Arc::ptr_eq(r, reactor)) {
                seen.push(reactor);
            }
        }
        seen
    }
}

impl fmt::Debug for Reactors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactors")
            .field("channels", &self.channels())
            .finish()
    }
}
