//! UPnP IGD gateways
//!
//! Uses the igd-next crate. Its calls block on HTTP and SSDP, so each one
//! runs in a blocking task.

use crate::nat::auto::Probe;
use crate::nat::{Nat, NatError, PortMapping, Protocol};
use futures::future::FutureExt;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for an SSDP answer
const SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// A UPnP gateway found on the local network
#[derive(Debug, Clone)]
pub struct UpnpGateway {
    gateway: igd_next::Gateway,
    local_ip: Ipv4Addr,
}

impl UpnpGateway {
    /// Search the local network for an IGD
    pub async fn discover() -> Result<Self, NatError> {
        let local_ip = get_local_ip()
            .ok_or_else(|| NatError::Upnp("no local IPv4 address".to_string()))?;

        let gateway = blocking(|| {
            let options = SearchOptions {
                timeout: Some(SEARCH_TIMEOUT),
                ..Default::default()
            };
            igd_next::search_gateway(options).map_err(|e| NatError::Upnp(e.to_string()))
        })
        .await?;

        log::info!("Found UPnP gateway: {}", gateway.addr);
        Ok(Self { gateway, local_ip })
    }

    pub fn addr(&self) -> SocketAddr {
        self.gateway.addr
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub async fn external_address(&self) -> Result<IpAddr, NatError> {
        let gateway = self.gateway.clone();
        blocking(move || {
            gateway
                .get_external_ip()
                .map_err(|e| NatError::Upnp(e.to_string()))
        })
        .await
    }

    /// Forward `mapping.external_port` to our internal port, replacing any
    /// stale rule for the same port
    pub async fn add_port(&self, mapping: &PortMapping) -> Result<u16, NatError> {
        let gateway = self.gateway.clone();
        let protocol = igd_protocol(mapping.protocol);
        let local_addr = SocketAddr::V4(SocketAddrV4::new(self.local_ip, mapping.internal_port));
        let external_port = mapping.external_port;
        let lease = u32::try_from(mapping.lease.as_secs()).unwrap_or(u32::MAX);
        let description = mapping.description.clone();

        blocking(move || {
            let _ = gateway.remove_port(protocol, external_port);
            gateway
                .add_port(protocol, external_port, local_addr, lease, &description)
                .map_err(|e| NatError::Upnp(e.to_string()))
        })
        .await?;

        Ok(external_port)
    }

    pub async fn remove_port(&self, protocol: Protocol, external_port: u16) -> Result<(), NatError> {
        let gateway = self.gateway.clone();
        blocking(move || {
            gateway
                .remove_port(igd_protocol(protocol), external_port)
                .map_err(|e| NatError::Upnp(e.to_string()))
        })
        .await
    }
}

/// Probe for [`AutoDiscover`](crate::nat::AutoDiscover)
pub fn probe() -> Probe {
    Arc::new(|| UpnpGateway::discover().map(|found| found.map(Nat::Upnp)).boxed())
}

fn igd_protocol(protocol: Protocol) -> PortMappingProtocol {
    match protocol {
        Protocol::Tcp => PortMappingProtocol::TCP,
        Protocol::Udp => PortMappingProtocol::UDP,
    }
}

async fn blocking<T, F>(f: F) -> Result<T, NatError>
where
    F: FnOnce() -> Result<T, NatError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NatError::Upnp(format!("UPnP task failed: {}", e)))?
}

/// Local IPv4 address of the default route
///
/// Connecting a UDP socket sends nothing; it only picks the route.
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
