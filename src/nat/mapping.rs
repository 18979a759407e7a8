//! Port mapping supervisor
//!
//! Keeps one port forwarded for as long as the node runs: the mapping is
//! requested as soon as the supervisor starts and renewed on a timer well
//! inside its lease. Failures are logged and retried on the next tick.
//! Stopping the supervisor deletes the mapping on a best-effort basis.

use crate::nat::{Nat, PortMapping, MAP_UPDATE_INTERVAL};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What the supervisor has achieved so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingStatus {
    /// The last request succeeded
    pub mapped: bool,
    /// External port granted by the last successful request
    pub external_port: Option<u16>,
    pub attempts: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

pub struct PortMapper {
    nat: Arc<Nat>,
    mapping: PortMapping,
    refresh_interval: Duration,
}

impl PortMapper {
    pub fn new(nat: Arc<Nat>, mapping: PortMapping) -> Self {
        Self {
            nat,
            mapping,
            refresh_interval: MAP_UPDATE_INTERVAL,
        }
    }

    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Supervise `mapping` with the default refresh interval
    pub fn spawn(nat: Arc<Nat>, mapping: PortMapping) -> MappingHandle {
        Self::new(nat, mapping).start()
    }

    pub fn start(self) -> MappingHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status) = watch::channel(MappingStatus::default());
        let task = tokio::spawn(self.run(cancel.clone(), status_tx));

        MappingHandle {
            cancel,
            task,
            status,
        }
    }

    async fn run(self, cancel: CancellationToken, status: watch::Sender<MappingStatus>) {
        // First tick fires at once: that is the initial request.
        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {}
            }
            // Not raced against cancellation: a request already sent to the
            // gateway completes before the cleanup below.
            self.refresh(&status).await;
        }

        // Nothing to delete if no request ever succeeded.
        if status.borrow().external_port.is_none() {
            log::debug!("No port mapping to delete");
            return;
        }

        let mapping = &self.mapping;
        match self
            .nat
            .delete_port_mapping(mapping.protocol, mapping.external_port, mapping.internal_port)
            .await
        {
            Ok(()) => log::debug!(
                "Deleted port mapping {} {}",
                mapping.protocol,
                mapping.external_port
            ),
            Err(e) => log::debug!("Failed to delete port mapping: {}", e),
        }
        status.send_modify(|s| s.mapped = false);
    }

    async fn refresh(&self, status: &watch::Sender<MappingStatus>) {
        let mapping = &self.mapping;
        let result = self.nat.add_port_mapping(mapping).await;
        let previous = status.borrow().external_port;

        match &result {
            Ok(port) if previous != Some(*port) => {
                if *port == mapping.external_port {
                    log::info!(
                        "Mapped {} port {} -> {} via {}",
                        mapping.protocol,
                        port,
                        mapping.internal_port,
                        self.nat
                    );
                } else {
                    log::info!(
                        "Mapped alternative {} port {} -> {} via {} (wanted {})",
                        mapping.protocol,
                        port,
                        mapping.internal_port,
                        self.nat,
                        mapping.external_port
                    );
                }
            }
            Ok(port) => log::debug!("Renewed port mapping {}", port),
            Err(e) => log::warn!(
                "Couldn't add port mapping {} {}: {}",
                mapping.protocol,
                mapping.external_port,
                e
            ),
        }

        status.send_modify(|s| {
            s.attempts += 1;
            match result {
                Ok(port) => {
                    s.mapped = true;
                    s.external_port = Some(port);
                    s.last_error = None;
                }
                Err(e) => {
                    s.mapped = false;
                    s.failures += 1;
                    s.last_error = Some(e.to_string());
                }
            }
        });
    }
}

/// Control over a running supervisor
///
/// Dropping the handle cancels the supervisor; [`stop`](Self::stop) also
/// waits for the mapping to be deleted.
pub struct MappingHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: watch::Receiver<MappingStatus>,
}

impl MappingHandle {
    pub fn status(&self) -> MappingStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MappingStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the supervisor to clean up
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            log::warn!("Port mapping task failed: {}", e);
        }
    }
}

impl Drop for MappingHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
