//! NAT traversal
//!
//! A [`Nat`] is one way of learning the node's public address and asking
//! the local router to forward a port to us:
//!
//! - `ExtIp`: the operator already knows the address; nothing is mapped
//! - `Upnp`: an IGD gateway found over SSDP
//! - `Pmp`: a NAT-PMP (RFC 6886) gateway
//! - `Auto`: discover one of the above on first use
//!
//! Mechanisms are chosen from a short text form, see [`parse`].

pub mod auto;
pub mod mapping;
pub mod pmp;
pub mod upnp;

pub use auto::{AutoDiscover, Probe};
pub use mapping::{MappingHandle, MappingStatus, PortMapper};
pub use pmp::PmpGateway;
pub use upnp::UpnpGateway;

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Lease requested for each mapping
pub const MAP_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How often a live mapping is renewed
pub const MAP_UPDATE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Error, Debug)]
pub enum NatError {
    #[error("{0}")]
    Parse(String),
    #[error("no {0} router discovered")]
    NoRouter(String),
    #[error("UPnP error: {0}")]
    Upnp(String),
    #[error("NAT-PMP error: {0}")]
    Pmp(String),
    #[error("NAT-PMP request to {0} timed out")]
    Timeout(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A forwarding rule to request from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub external_port: u16,
    pub internal_port: u16,
    pub description: String,
    pub lease: Duration,
}

impl PortMapping {
    /// Map `port` to itself over TCP with the default lease
    pub fn tcp(port: u16, description: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            external_port: port,
            internal_port: port,
            description: description.into(),
            lease: MAP_TIMEOUT,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// A NAT traversal mechanism
#[derive(Debug)]
pub enum Nat {
    ExtIp(IpAddr),
    Upnp(UpnpGateway),
    Pmp(PmpGateway),
    Auto(AutoDiscover),
}

impl Nat {
    /// Race UPnP and NAT-PMP discovery
    pub fn any() -> Self {
        Nat::Auto(AutoDiscover::new(
            "UPnP or NAT-PMP",
            vec![upnp::probe(), pmp::probe()],
        ))
    }

    /// Discover a UPnP gateway on first use
    pub fn upnp() -> Self {
        Nat::Auto(AutoDiscover::new("UPnP", vec![upnp::probe()]))
    }

    /// Use NAT-PMP on the default gateway, found on first use
    pub fn pmp() -> Self {
        Nat::Auto(AutoDiscover::new("NAT-PMP", vec![pmp::probe()]))
    }

    /// The node's address as seen from outside
    pub async fn external_address(&self) -> Result<IpAddr, NatError> {
        match self {
            Nat::Auto(auto) => auto.resolve().await?.direct_external_address().await,
            nat => nat.direct_external_address().await,
        }
    }

    /// Ask the gateway to forward `mapping`, returning the external port
    /// actually mapped
    pub async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<u16, NatError> {
        match self {
            Nat::Auto(auto) => auto.resolve().await?.direct_add_port_mapping(mapping).await,
            nat => nat.direct_add_port_mapping(mapping).await,
        }
    }

    pub async fn delete_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), NatError> {
        match self {
            Nat::Auto(auto) => {
                auto.resolve()
                    .await?
                    .direct_delete_port_mapping(protocol, external_port, internal_port)
                    .await
            }
            nat => {
                nat.direct_delete_port_mapping(protocol, external_port, internal_port)
                    .await
            }
        }
    }

    // The direct_* helpers never resolve; a discoverer only ever yields a
    // concrete mechanism.

    async fn direct_external_address(&self) -> Result<IpAddr, NatError> {
        match self {
            Nat::ExtIp(ip) => Ok(*ip),
            Nat::Upnp(gateway) => gateway.external_address().await,
            Nat::Pmp(gateway) => Ok(IpAddr::V4(gateway.external_address().await?)),
            Nat::Auto(auto) => Err(NatError::NoRouter(auto.label().to_string())),
        }
    }

    async fn direct_add_port_mapping(&self, mapping: &PortMapping) -> Result<u16, NatError> {
        match self {
            // Nothing to ask for: the address is forwarded already.
            Nat::ExtIp(_) => Ok(mapping.external_port),
            Nat::Upnp(gateway) => gateway.add_port(mapping).await,
            Nat::Pmp(gateway) => gateway.add_port(mapping).await,
            Nat::Auto(auto) => Err(NatError::NoRouter(auto.label().to_string())),
        }
    }

    async fn direct_delete_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), NatError> {
        match self {
            Nat::ExtIp(_) => Ok(()),
            Nat::Upnp(gateway) => gateway.remove_port(protocol, external_port).await,
            Nat::Pmp(gateway) => gateway.remove_port(protocol, internal_port).await,
            Nat::Auto(auto) => Err(NatError::NoRouter(auto.label().to_string())),
        }
    }
}

impl fmt::Display for Nat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nat::ExtIp(ip) => write!(f, "ExtIP({})", ip),
            Nat::Upnp(gateway) => write!(f, "UPnP({})", gateway.addr()),
            Nat::Pmp(gateway) => write!(f, "NAT-PMP({})", gateway.gateway()),
            Nat::Auto(auto) => match auto.resolved() {
                Some(found) => fmt::Display::fmt(found, f),
                None => f.write_str(auto.label()),
            },
        }
    }
}

/// Parse a mechanism description
///
/// Accepted forms (case-insensitive):
///
/// ```text
/// "" | "none" | "off"          no NAT traversal
/// "any" | "auto" | "on"        first of UPnP or NAT-PMP to answer
/// "extip:77.12.33.4"           fixed external address ("ip:" works too)
/// "upnp"                       UPnP
/// "pmp"                        NAT-PMP on the default gateway
/// "pmp:192.168.0.1"            NAT-PMP on the given gateway
/// ```
pub fn parse(input: &str) -> Result<Option<Nat>, NatError> {
    let input = input.trim();
    let (mechanism, ip) = match input.split_once(':') {
        Some((mechanism, ip)) => (mechanism, Some(ip)),
        None => (input, None),
    };

    let ip = ip
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|_| NatError::Parse("invalid IP address".to_string()))
        })
        .transpose()?;

    match mechanism.to_lowercase().as_str() {
        "" | "none" | "off" => Ok(None),
        "any" | "auto" | "on" => Ok(Some(Nat::any())),
        "extip" | "ip" => match ip {
            Some(ip) => Ok(Some(Nat::ExtIp(ip))),
            None => Err(NatError::Parse("missing IP address".to_string())),
        },
        "upnp" => Ok(Some(Nat::upnp())),
        "pmp" | "natpmp" | "nat-pmp" => match ip {
            None => Ok(Some(Nat::pmp())),
            Some(IpAddr::V4(gateway)) => Ok(Some(Nat::Pmp(PmpGateway::new(gateway)))),
            Some(IpAddr::V6(_)) => Err(NatError::Parse(
                "NAT-PMP gateway must be an IPv4 address".to_string(),
            )),
        },
        other => Err(NatError::Parse(format!("unknown mechanism {:?}", other))),
    }
}
