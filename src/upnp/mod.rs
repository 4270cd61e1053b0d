//! UPnP IGD (Internet Gateway Device) backend
//!
//! Three of the four discovery probes live here. The IG1 and IG2 probes search
//! over SSDP for a WAN connection device of their profile, walk every service
//! of each root device, and accept the first IP or PPP connection service that
//! reports NAT as enabled through `GetNATRSIPStatus`. The generic probe lets
//! `igd-next` find any InternetGatewayDevice and validates it with an external
//! address query.
//!
//! Whatever the probe, the result is an [`UpnpHandle`] driving a
//! [`UpnpControl`] client.

pub mod igd;
pub mod soap;
pub mod ssdp;

use crate::allocator::{lease_seconds, MappingBackend, PortAllocator};
use crate::config::NatConfig;
use crate::discovery::Probe;
use crate::handle::NatHandle;
use crate::interfaces::{internal_address_for, InterfaceSource};
use crate::types::{NatError, PortPair, Protocol};
use crate::Result;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use igd::{GenericIgdProbe, IgdNextClient, GENERIC_IGD_TYPE};
pub use soap::SoapClient;
pub use ssdp::{RootDevice, ServiceInfo, SsdpFinder};

/// WAN connection device of InternetGatewayDevice:1
pub const URN_WAN_CONNECTION_DEVICE_1: &str = "urn:schemas-upnp-org:device:WANConnectionDevice:1";
/// WAN connection device of InternetGatewayDevice:2
pub const URN_WAN_CONNECTION_DEVICE_2: &str = "urn:schemas-upnp-org:device:WANConnectionDevice:2";
/// IP connection service, version 1
pub const URN_WAN_IP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
/// IP connection service, version 2
pub const URN_WAN_IP_CONNECTION_2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";
/// PPP connection service, version 1
pub const URN_WAN_PPP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

/// A device profile searched by one discovery probe
#[derive(Debug)]
pub struct UpnpProfile {
    /// Short profile name used in type strings, e.g. `IG1`
    pub label: &'static str,
    /// Device type searched over SSDP
    pub device_urn: &'static str,
    /// Accepted service types and their short names, e.g. `IP1`
    pub services: &'static [(&'static str, &'static str)],
}

impl UpnpProfile {
    /// Short name of `service_type` if this profile accepts it
    pub fn service_label(&self, service_type: &str) -> Option<&'static str> {
        self.services
            .iter()
            .find(|(urn, _)| *urn == service_type)
            .map(|(_, label)| *label)
    }

    /// Handle type string for one of this profile's services
    pub fn type_name(&self, service_label: &str) -> String {
        format!("UPNP ({}-{})", self.label, service_label)
    }
}

/// InternetGatewayDevice:1 profile
pub static IG1: UpnpProfile = UpnpProfile {
    label: "IG1",
    device_urn: URN_WAN_CONNECTION_DEVICE_1,
    services: &[
        (URN_WAN_IP_CONNECTION_1, "IP1"),
        (URN_WAN_PPP_CONNECTION_1, "PPP1"),
    ],
};

/// InternetGatewayDevice:2 profile
pub static IG2: UpnpProfile = UpnpProfile {
    label: "IG2",
    device_urn: URN_WAN_CONNECTION_DEVICE_2,
    services: &[
        (URN_WAN_IP_CONNECTION_1, "IP1"),
        (URN_WAN_IP_CONNECTION_2, "IP2"),
        (URN_WAN_PPP_CONNECTION_1, "PPP1"),
    ],
};

/// Arguments of the `AddPortMapping` action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPortMapping<'a> {
    /// Remote host filter, empty for any
    pub remote_host: &'a str,
    /// External port on the gateway
    pub external_port: u16,
    /// `"TCP"` or `"UDP"`
    pub protocol: &'a str,
    /// Port on the internal client
    pub internal_port: u16,
    /// Address of the internal client
    pub internal_client: &'a str,
    /// Whether the mapping is enabled
    pub enabled: bool,
    /// Free-form description stored on the gateway
    pub description: &'a str,
    /// Lease in seconds, `0` meaning whatever the gateway makes of it
    pub lease_secs: u32,
}

/// Reply of the `GetNATRSIPStatus` action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsipStatus {
    /// Realm-specific IP available
    pub rsip_available: bool,
    /// NAT enabled on this connection
    pub nat_enabled: bool,
}

/// Commands the UPnP backend needs from a control-point client
#[async_trait]
pub trait UpnpControl: Send + Sync {
    /// Address of the root device, from its advertised base location
    async fn gateway_address(&self) -> Result<IpAddr>;

    /// Raw `NewExternalIPAddress` value
    async fn get_external_ip_address(&self) -> Result<String>;

    /// Create or renew a mapping
    async fn add_port_mapping(&self, request: &AddPortMapping<'_>) -> Result<()>;

    /// Remove a mapping
    async fn delete_port_mapping(
        &self,
        remote_host: &str,
        external_port: u16,
        protocol: &str,
    ) -> Result<()>;

    /// Whether NAT is active on this connection
    async fn get_nat_rsip_status(&self) -> Result<RsipStatus>;
}

/// Finds root devices and builds control clients for their services
#[async_trait]
pub trait DeviceFinder: Send + Sync {
    /// Root devices answering a search for `device_urn`
    async fn discover_devices(&self, device_urn: &str) -> Result<Vec<RootDevice>>;

    /// Control client for one service of `device`
    fn connect(&self, device: &RootDevice, service: &ServiceInfo) -> Result<Box<dyn UpnpControl>>;
}

struct UpnpBinder<'a> {
    client: &'a dyn UpnpControl,
    internal_client: String,
}

#[async_trait]
impl MappingBackend for UpnpBinder<'_> {
    async fn bind(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease_secs: u32,
    ) -> Result<()> {
        let request = AddPortMapping {
            remote_host: "",
            external_port,
            protocol: protocol.upnp_name(),
            internal_port,
            internal_client: &self.internal_client,
            enabled: true,
            description,
            lease_secs,
        };
        self.client.add_port_mapping(&request).await
    }
}

/// A gateway reached over UPnP
pub struct UpnpHandle {
    backend_type: String,
    client: Box<dyn UpnpControl>,
    interfaces: Arc<dyn InterfaceSource>,
    allocator: Mutex<PortAllocator>,
}

impl UpnpHandle {
    /// Wrap a control client that has been confirmed live
    pub fn new(
        backend_type: impl Into<String>,
        client: Box<dyn UpnpControl>,
        allocator: PortAllocator,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Self {
        Self {
            backend_type: backend_type.into(),
            client,
            interfaces,
            allocator: Mutex::new(allocator),
        }
    }
}

#[async_trait]
impl NatHandle for UpnpHandle {
    fn backend_type(&self) -> &str {
        &self.backend_type
    }

    async fn device_address(&self) -> Result<IpAddr> {
        self.client.gateway_address().await
    }

    async fn external_address(&self) -> Result<IpAddr> {
        let reply = self.client.get_external_ip_address().await?;
        reply
            .trim()
            .parse()
            .map_err(|_| NatError::NoExternalAddress(reply))
    }

    async fn internal_address(&self) -> Result<IpAddr> {
        let device = self.device_address().await?;
        internal_address_for(device, self.interfaces.as_ref())
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<PortPair> {
        let internal_client = self.internal_address().await?;
        let binder = UpnpBinder {
            client: self.client.as_ref(),
            internal_client: internal_client.to_string(),
        };

        let mut allocator = self.allocator.lock().await;
        let pair = allocator
            .allocate(&binder, protocol, external_port, internal_port, description, lease)
            .await?;

        info!(
            "{} {} mapping {} -> {}:{} ({}s)",
            self.backend_type,
            protocol,
            pair.external,
            internal_client,
            pair.internal,
            lease_seconds(lease)
        );
        Ok(pair)
    }

    async fn delete_port_mapping(&self, protocol: Protocol, external_port: u16) -> Result<()> {
        let mut allocator = self.allocator.lock().await;
        if allocator.release(external_port).is_none() {
            return Ok(());
        }

        debug!(
            "Deleting {} {} mapping {}",
            self.backend_type, protocol, external_port
        );
        self.client
            .delete_port_mapping("", external_port, protocol.upnp_name())
            .await
    }

    async fn mappings(&self) -> Vec<PortPair> {
        self.allocator.lock().await.mappings()
    }
}

/// First service of `profile` on any found device that reports NAT as enabled
///
/// Search stops at the first match; the remaining services and devices are
/// never queried.
pub async fn find_nat_service(
    finder: &dyn DeviceFinder,
    profile: &UpnpProfile,
) -> Option<(String, Box<dyn UpnpControl>)> {
    let devices = match finder.discover_devices(profile.device_urn).await {
        Ok(devices) => devices,
        Err(e) => {
            debug!("{} search failed: {}", profile.label, e);
            return None;
        }
    };

    for device in &devices {
        debug!(
            "{} checking {} at {}",
            profile.label, device.device_type, device.location
        );
        for service in &device.services {
            let Some(label) = profile.service_label(&service.service_type) else {
                continue;
            };

            let client = match finder.connect(device, service) {
                Ok(client) => client,
                Err(e) => {
                    debug!("Cannot control {}: {}", service.control_url, e);
                    continue;
                }
            };

            match client.get_nat_rsip_status().await {
                Ok(status) if status.nat_enabled => {
                    info!(
                        "{} on {} has NAT enabled (RSIP available: {})",
                        label, device.location, status.rsip_available
                    );
                    return Some((profile.type_name(label), client));
                }
                Ok(_) => debug!("{} at {} has NAT disabled", label, service.control_url),
                Err(e) => debug!("GetNATRSIPStatus on {} failed: {}", service.control_url, e),
            }
        }
    }

    None
}

/// Discovery probe for one UPnP device profile
pub struct UpnpProfileProbe {
    profile: &'static UpnpProfile,
    finder: Arc<dyn DeviceFinder>,
    config: NatConfig,
    interfaces: Arc<dyn InterfaceSource>,
}

impl UpnpProfileProbe {
    /// Create a probe searching with `finder`
    pub fn new(
        profile: &'static UpnpProfile,
        finder: Arc<dyn DeviceFinder>,
        config: NatConfig,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Self {
        Self {
            profile,
            finder,
            config,
            interfaces,
        }
    }

    async fn discover(&self) -> Option<UpnpHandle> {
        let (backend_type, client) = find_nat_service(self.finder.as_ref(), self.profile).await?;
        info!("Found UPnP gateway: {}", backend_type);
        Some(UpnpHandle::new(
            backend_type,
            client,
            PortAllocator::new(self.config.allocation),
            self.interfaces.clone(),
        ))
    }
}

#[async_trait]
impl Probe for UpnpProfileProbe {
    fn name(&self) -> &str {
        self.profile.label
    }

    async fn run(&self, cancel: CancellationToken) -> Option<Box<dyn NatHandle>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            handle = self.discover() => handle.map(|h| Box::new(h) as Box<dyn NatHandle>),
        }
    }
}
