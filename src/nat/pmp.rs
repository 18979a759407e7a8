//! NAT-PMP gateways
//!
//! Mapping and address queries go through the crab_nat crate, which speaks
//! PCP and falls back to NAT-PMP (RFC 6886) when the router only knows the
//! older protocol. Each granted mapping is kept so it can be renewed and
//! released later; a mapping is identified by protocol and internal port.

use crate::nat::auto::Probe;
use crate::nat::{Nat, NatError, PortMapping, Protocol};
use futures::future::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU16, NonZeroU32};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long one exchange with the gateway may take, retries included
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Gateway
// =============================================================================

pub struct PmpGateway {
    gateway: Ipv4Addr,
    /// Our address on the gateway's network; looked up when first needed
    client: Option<Ipv4Addr>,
    leases: Mutex<HashMap<(Protocol, u16), crab_nat::PortMapping>>,
}

impl PmpGateway {
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self {
            gateway,
            client: None,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Gateway reached from a known local address
    pub fn with_client(gateway: Ipv4Addr, client: Ipv4Addr) -> Self {
        Self {
            client: Some(client),
            ..Self::new(gateway)
        }
    }

    /// Use the default gateway, if it answers NAT-PMP
    pub async fn discover() -> Result<Self, NatError> {
        let gateway = default_gateway()?;
        let pmp = Self::new(gateway);
        let external = pmp.external_address().await?;
        log::info!("Found NAT-PMP gateway {} (external address {})", gateway, external);
        Ok(pmp)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub async fn external_address(&self) -> Result<Ipv4Addr, NatError> {
        self.request(crab_nat::natpmp::external_address(
            IpAddr::V4(self.gateway),
            None,
        ))
        .await
    }

    /// Request `mapping`, or renew it if we already hold it. The gateway may
    /// grant a different external port.
    pub async fn add_port(&self, mapping: &PortMapping) -> Result<u16, NatError> {
        let internal_port = NonZeroU16::new(mapping.internal_port)
            .ok_or_else(|| NatError::Pmp("internal port must be non-zero".to_string()))?;
        let key = (mapping.protocol, mapping.internal_port);

        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get_mut(&key) {
            match self.request(lease.renew()).await {
                Ok(()) => return Ok(lease.external_port().get()),
                Err(e) => {
                    log::debug!("Renewal of {} port {} failed: {}", key.0, key.1, e);
                    leases.remove(&key);
                }
            }
        }

        let client = match self.client {
            Some(client) => client,
            None => local_ipv4()?,
        };
        let lifetime = u32::try_from(mapping.lease.as_secs()).unwrap_or(u32::MAX);
        let options = crab_nat::PortMappingOptions {
            external_port: NonZeroU16::new(mapping.external_port),
            lifetime_seconds: NonZeroU32::new(lifetime).map(NonZeroU32::get),
            ..Default::default()
        };

        let lease = self
            .request(crab_nat::PortMapping::new(
                IpAddr::V4(self.gateway),
                IpAddr::V4(client),
                internet_protocol(mapping.protocol),
                internal_port,
                options,
            ))
            .await?;
        let external_port = lease.external_port().get();
        leases.insert(key, lease);
        Ok(external_port)
    }

    /// Release the mapping held for `internal_port`
    pub async fn remove_port(&self, protocol: Protocol, internal_port: u16) -> Result<(), NatError> {
        let Some(lease) = self.leases.lock().await.remove(&(protocol, internal_port)) else {
            log::debug!("No {} mapping held for port {}", protocol, internal_port);
            return Ok(());
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, lease.try_drop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err((e, _))) => Err(NatError::Pmp(format!("{:?}", e))),
            Err(_) => Err(NatError::Timeout(self.gateway.to_string())),
        }
    }

    /// Number of mappings currently held
    pub async fn lease_count(&self) -> usize {
        self.leases.lock().await.len()
    }

    async fn request<T, E: fmt::Debug>(
        &self,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, NatError> {
        tokio::time::timeout(REQUEST_TIMEOUT, call)
            .await
            .map_err(|_| NatError::Timeout(self.gateway.to_string()))?
            .map_err(|e| NatError::Pmp(format!("{:?}", e)))
    }
}

impl fmt::Debug for PmpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmpGateway")
            .field("gateway", &self.gateway)
            .field("client", &self.client)
            .finish()
    }
}

/// Probe for [`AutoDiscover`](crate::nat::AutoDiscover)
pub fn probe() -> Probe {
    Arc::new(|| PmpGateway::discover().map(|found| found.map(Nat::Pmp)).boxed())
}

fn internet_protocol(protocol: Protocol) -> crab_nat::InternetProtocol {
    match protocol {
        Protocol::Tcp => crab_nat::InternetProtocol::Tcp,
        Protocol::Udp => crab_nat::InternetProtocol::Udp,
    }
}

// =============================================================================
// Network Detection
// =============================================================================

/// IPv4 default gateway of this host
pub fn default_gateway() -> Result<Ipv4Addr, NatError> {
    let gateway = default_net::get_default_gateway()
        .map_err(|e| NatError::Pmp(format!("failed to detect default gateway: {}", e)))?;
    ipv4_gateway(gateway.ip_addr)
}

fn ipv4_gateway(ip: IpAddr) -> Result<Ipv4Addr, NatError> {
    match ip {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(NatError::Pmp(format!(
            "gateway has IPv6 address {}, expected IPv4",
            ip
        ))),
    }
}

/// First routable IPv4 address on a non-loopback interface
pub fn local_ipv4() -> Result<Ipv4Addr, NatError> {
    default_net::get_interfaces()
        .iter()
        .filter(|iface| !iface.is_loopback())
        .flat_map(|iface| iface.ipv4.iter().map(|net| net.addr))
        .find(|addr| !addr.is_loopback() && !addr.is_link_local())
        .ok_or_else(|| NatError::Pmp("no local IPv4 address".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_must_be_ipv4() {
        let gateway = ipv4_gateway("192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!(gateway, Ipv4Addr::new(192, 168, 1, 1));

        let err = ipv4_gateway("fe80::1".parse().unwrap()).unwrap_err();
        assert!(err.to_string().contains("expected IPv4"));
    }

    #[test]
    fn test_local_ipv4_is_routable() {
        // Sandboxes may have nothing but loopback.
        if let Ok(ip) = local_ipv4() {
            assert!(!ip.is_loopback());
            assert!(!ip.is_link_local());
        }
    }

    #[tokio::test]
    async fn test_zero_internal_port_rejected() {
        let gateway = PmpGateway::with_client(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        let mapping = PortMapping::tcp(0, "test");

        let err = gateway.add_port(&mapping).await.unwrap_err();
        assert!(matches!(err, NatError::Pmp(_)));
        assert_eq!(gateway.lease_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_mapping() {
        let gateway = PmpGateway::new(Ipv4Addr::new(192, 168, 0, 1));
        gateway.remove_port(Protocol::Tcp, 8333).await.unwrap();
        assert_eq!(gateway.lease_count().await, 0);
    }

    #[tokio::test]
    async fn test_silent_gateway_fails() {
        // Nothing serves NAT-PMP on loopback.
        let gateway = PmpGateway::with_client(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        assert!(gateway.external_address().await.is_err());

        let err = gateway.add_port(&PortMapping::tcp(8333, "test")).await.unwrap_err();
        assert!(matches!(err, NatError::Pmp(_) | NatError::Timeout(_)));
        assert_eq!(gateway.lease_count().await, 0);
    }

    #[test]
    fn test_debug_shows_gateway() {
        let gateway = PmpGateway::new(Ipv4Addr::new(10, 0, 0, 1));
        assert!(format!("{:?}", gateway).contains("10.0.0.1"));
    }
}
