//! Lazy mechanism discovery
//!
//! An [`AutoDiscover`] holds a set of probes, each of which tries to find
//! one kind of gateway. The first caller to need the mechanism starts every
//! probe at once on a background task; the first to succeed wins and the
//! others are dropped. Every caller, including ones arriving after an
//! earlier caller gave up waiting, shares that single run, and the outcome,
//! success or not, is kept for the life of the value.

use crate::nat::{Nat, NatError};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

/// Attempt to discover one concrete mechanism
pub type Probe = Arc<dyn Fn() -> BoxFuture<'static, Result<Nat, NatError>> + Send + Sync>;

type Discovery = Shared<BoxFuture<'static, Option<Arc<Nat>>>>;

pub struct AutoDiscover {
    label: String,
    probes: Vec<Probe>,
    discovery: OnceLock<Discovery>,
    found: OnceCell<Option<Arc<Nat>>>,
}

impl AutoDiscover {
    pub fn new(label: impl Into<String>, probes: Vec<Probe>) -> Self {
        Self {
            label: label.into(),
            probes,
            discovery: OnceLock::new(),
            found: OnceCell::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The discovered mechanism, if discovery has run and succeeded
    pub fn resolved(&self) -> Option<&Nat> {
        self.found.get().and_then(|found| found.as_deref())
    }

    /// Discover the mechanism, or return the one found earlier
    ///
    /// Dropping the returned future does not abort discovery.
    pub async fn resolve(&self) -> Result<&Nat, NatError> {
        self.found
            .get_or_init(|| self.discovery().clone())
            .await
            .as_deref()
            .ok_or_else(|| NatError::NoRouter(self.label.clone()))
    }

    fn discovery(&self) -> &Discovery {
        self.discovery.get_or_init(|| {
            let task = tokio::spawn(discover(self.label.clone(), self.probes.clone()));
            task.map(|joined| joined.ok().flatten()).boxed().shared()
        })
    }
}

async fn discover(label: String, probes: Vec<Probe>) -> Option<Arc<Nat>> {
    log::debug!("Probing for {} ({} probes)", label, probes.len());

    let mut pending: FuturesUnordered<_> = probes.iter().map(|probe| probe()).collect();
    while let Some(result) = pending.next().await {
        match result {
            Ok(nat) => {
                log::info!("Discovered {}", nat);
                return Some(Arc::new(nat));
            }
            Err(e) => log::debug!("{} probe failed: {}", label, e),
        }
    }

    log::warn!("No {} router discovered", label);
    None
}

impl fmt::Debug for AutoDiscover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoDiscover")
            .field("label", &self.label)
            .field("probes", &self.probes.len())
            .field("found", &self.found.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::FutureExt;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn probe(
        calls: Arc<AtomicUsize>,
        delay: Duration,
        answer: Option<&'static str>,
    ) -> Probe {
        Arc::new(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                match answer {
                    Some(ip) => Ok(Nat::ExtIp(ip.parse::<IpAddr>().unwrap())),
                    None => Err(NatError::Pmp("no answer".to_string())),
                }
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_share_one_discovery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let auto = AutoDiscover::new(
            "test",
            vec![probe(calls.clone(), Duration::from_secs(1), Some("1.2.3.4"))],
        );

        let results = futures::future::join_all((0..8).map(|_| auto.resolve())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().to_string(), "ExtIP(1.2.3.4)");
        }

        // Later calls reuse the cached mechanism.
        auto.resolve().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let auto = AutoDiscover::new(
            "test",
            vec![
                probe(calls.clone(), Duration::from_secs(5), Some("5.5.5.5")),
                probe(calls.clone(), Duration::from_millis(10), None),
                probe(calls.clone(), Duration::from_secs(1), Some("1.1.1.1")),
            ],
        );

        let nat = auto.resolve().await.unwrap();
        assert_eq!(nat.to_string(), "ExtIP(1.1.1.1)");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_resolve_keeps_discovery_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let auto = AutoDiscover::new(
            "test",
            vec![probe(calls.clone(), Duration::from_secs(3), Some("4.4.4.4"))],
        );

        // The caller gives up long before the probe answers.
        let abandoned = tokio::time::timeout(Duration::from_millis(100), auto.resolve()).await;
        assert!(abandoned.is_err());
        assert!(auto.resolved().is_none());

        let nat = auto.resolve().await.unwrap();
        assert_eq!(nat.to_string(), "ExtIP(4.4.4.4)");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let auto = AutoDiscover::new(
            "test",
            vec![
                probe(calls.clone(), Duration::ZERO, None),
                probe(calls.clone(), Duration::ZERO, None),
            ],
        );

        for _ in 0..3 {
            let err = auto.resolve().await.unwrap_err();
            assert!(matches!(&err, NatError::NoRouter(label) if label == "test"));
            assert_eq!(err.to_string(), "no test router discovered");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(auto.resolved().is_none());
    }

    #[tokio::test]
    async fn test_display_follows_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let nat = Nat::Auto(AutoDiscover::new(
            "UPnP or NAT-PMP",
            vec![probe(calls, Duration::ZERO, Some("9.9.9.9"))],
        ));
        assert_eq!(nat.to_string(), "UPnP or NAT-PMP");

        assert_eq!(nat.external_address().await.unwrap().to_string(), "9.9.9.9");
        assert_eq!(nat.to_string(), "ExtIP(9.9.9.9)");
    }
}
