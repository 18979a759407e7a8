//! Banned and whitelisted addresses
//!
//! Consulted by the admission controller before a connection may take a
//! handshake slot. Whitelisted addresses are never refused.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default ban duration (24 hours)
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// A single ban
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanEntry {
    /// `None` bans until explicitly lifted
    pub until: Option<Instant>,
}

impl BanEntry {
    fn is_active(&self, now: Instant) -> bool {
        self.until.map_or(true, |until| now < until)
    }
}

#[derive(Debug, Default)]
pub struct BanList {
    banned: RwLock<HashMap<IpAddr, BanEntry>>,
    whitelist: RwLock<HashSet<IpAddr>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration: permanent bans plus a whitelist
    pub fn with_entries(
        banned: impl IntoIterator<Item = IpAddr>,
        whitelist: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            banned: RwLock::new(
                banned
                    .into_iter()
                    .map(|ip| (ip, BanEntry { until: None }))
                    .collect(),
            ),
            whitelist: RwLock::new(whitelist.into_iter().collect()),
        }
    }

    /// Ban `ip`, for `duration` or forever
    pub async fn ban(&self, ip: IpAddr, duration: Option<Duration>) {
        let until = duration.map(|d| Instant::now() + d);
        self.banned.write().await.insert(ip, BanEntry { until });
        log::info!("Banned {} ({:?})", ip, duration);
    }

    pub async fn unban(&self, ip: &IpAddr) -> bool {
        self.banned.write().await.remove(ip).is_some()
    }

    pub async fn whitelist(&self, ip: IpAddr) {
        self.whitelist.write().await.insert(ip);
    }

    pub async fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.read().await.contains(ip)
    }

    /// Whether `ip` is under an active ban. Expired bans are dropped.
    pub async fn is_banned(&self, ip: &IpAddr) -> bool {
        let now = Instant::now();
        {
            let banned = self.banned.read().await;
            match banned.get(ip) {
                None => return false,
                Some(entry) if entry.is_active(now) => return true,
                Some(_) => {}
            }
        }

        let mut banned = self.banned.write().await;
        if banned.get(ip).is_some_and(|entry| !entry.is_active(now)) {
            banned.remove(ip);
        }
        false
    }

    /// Admission decision for a remote address
    pub async fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.is_whitelisted(ip).await || !self.is_banned(ip).await
    }

    /// Number of bans currently on record, expired or not
    pub async fn len(&self) -> usize {
        self.banned.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.banned.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_permanent_ban() {
        let list = BanList::new();
        list.ban(ip("10.0.0.1"), None).await;

        assert!(list.is_banned(&ip("10.0.0.1")).await);
        assert!(!list.is_allowed(&ip("10.0.0.1")).await);
        assert!(list.is_allowed(&ip("10.0.0.2")).await);

        assert!(list.unban(&ip("10.0.0.1")).await);
        assert!(list.is_allowed(&ip("10.0.0.1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_expires() {
        let list = BanList::new();
        list.ban(ip("10.0.0.1"), Some(Duration::from_secs(60))).await;
        assert!(list.is_banned(&ip("10.0.0.1")).await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!list.is_banned(&ip("10.0.0.1")).await);
        assert!(list.is_empty().await);
    }

    #[tokio::test]
    async fn test_whitelist_overrides_ban() {
        let list = BanList::with_entries([ip("10.0.0.1")], [ip("10.0.0.1")]);
        assert!(list.is_banned(&ip("10.0.0.1")).await);
        assert!(list.is_allowed(&ip("10.0.0.1")).await);
    }
}
