//! Node configuration
//!
//! Loaded from a JSON file; every field is optional and falls back to
//! its default. Command-line flags are applied on top by the binary.

use crate::nat::{self, NatError};
use crate::network::admission::DEFAULT_MAX_HANDSHAKES;
use crate::network::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::network::message::{NodeId, ServiceFlags};
use crate::network::registry::{
    RegistryConfig, DEFAULT_HANDOFF_CAPACITY, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_PEERS,
    DEFAULT_PING_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8333";

/// Default user agent advertised in the handshake
pub const DEFAULT_USER_AGENT: &str = concat!("blockchain-service/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Invalid NAT mechanism: {0}")]
    Nat(#[from] NatError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `host:port` to accept peers on
    pub listen_addr: String,
    /// NAT mechanism, see [`nat::parse`]
    pub nat: String,
    /// Concurrent handshakes
    pub max_handshakes: usize,
    pub handshake_timeout_secs: u64,
    /// Established peers queued for the registry
    pub handoff_capacity: usize,
    pub max_peers: usize,
    pub ping_interval_secs: u64,
    pub idle_timeout_secs: u64,
    /// Dialed once at startup
    pub bootstrap_peers: Vec<String>,
    /// Dialed at startup and let in past `max_peers`
    pub persistent_peers: Vec<String>,
    pub banned: Vec<IpAddr>,
    pub whitelist: Vec<IpAddr>,
    pub user_agent: String,
    /// Service bits advertised to peers
    pub services: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            nat: String::new(),
            max_handshakes: DEFAULT_MAX_HANDSHAKES,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            max_peers: DEFAULT_MAX_PEERS,
            ping_interval_secs: DEFAULT_PING_INTERVAL.as_secs(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            bootstrap_peers: Vec::new(),
            persistent_peers: Vec::new(),
            banned: Vec::new(),
            whitelist: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            services: ServiceFlags::default().bits(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let port = self
            .listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok());
        if port.is_none() {
            return Err(ConfigError::Invalid(format!(
                "listen_addr {:?} is not host:port",
                self.listen_addr
            )));
        }

        for (name, value) in [
            ("max_handshakes", self.max_handshakes as u64),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("handoff_capacity", self.handoff_capacity as u64),
            ("max_peers", self.max_peers as u64),
            ("ping_interval_secs", self.ping_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.idle_timeout_secs <= self.ping_interval_secs {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must exceed ping_interval_secs".to_string(),
            ));
        }

        nat::parse(&self.nat)?;
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_bits_truncate(self.services)
    }

    pub fn registry_config(&self, local_id: NodeId) -> RegistryConfig {
        RegistryConfig {
            local_id: Some(local_id),
            max_peers: self.max_peers,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8333");
        assert_eq!(config.max_handshakes, 50);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert!(config.services().contains(ServiceFlags::NETWORK));
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("node.json");
        fs::write(
            &path,
            r#"{ "listen_addr": "127.0.0.1:18444", "nat": "extip:10.0.0.5", "banned": ["10.1.1.1"] }"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:18444");
        assert_eq!(config.nat, "extip:10.0.0.5");
        assert_eq!(config.banned, vec!["10.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("node.json");

        let config = NodeConfig {
            bootstrap_peers: vec!["seed.example.org:8333".to_string()],
            max_handshakes: 8,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero = NodeConfig {
            max_handshakes: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));

        let no_port = NodeConfig {
            listen_addr: "0.0.0.0".to_string(),
            ..Default::default()
        };
        assert!(matches!(no_port.validate(), Err(ConfigError::Invalid(_))));

        let bad_nat = NodeConfig {
            nat: "extip".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad_nat.validate(), Err(ConfigError::Nat(_))));
    }

    #[test]
    fn test_malformed_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("node.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Parse(_))));

        let missing = temp_dir.path().join("missing.json");
        assert!(matches!(NodeConfig::load(&missing), Err(ConfigError::Io(_))));
    }
}
