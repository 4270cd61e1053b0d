//! Generic InternetGatewayDevice probe on top of `igd-next`

use super::{AddPortMapping, RsipStatus, UpnpControl, UpnpHandle};
use crate::allocator::PortAllocator;
use crate::config::NatConfig;
use crate::discovery::Probe;
use crate::handle::NatHandle;
use crate::interfaces::InterfaceSource;
use crate::types::NatError;
use crate::Result;
use async_trait::async_trait;
use igd_next::aio::tokio::Tokio;
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Type string of handles produced by the generic probe
pub const GENERIC_IGD_TYPE: &str = "UPNP (GenIGDev)";

fn to_igd_protocol(protocol: &str) -> Result<PortMappingProtocol> {
    match protocol {
        "TCP" => Ok(PortMappingProtocol::TCP),
        "UDP" => Ok(PortMappingProtocol::UDP),
        other => Err(NatError::InvalidProtocol(other.to_string())),
    }
}

/// Control client backed by an `igd-next` gateway
pub struct IgdNextClient {
    gateway: Gateway<Tokio>,
}

impl IgdNextClient {
    /// Wrap a gateway found by `igd-next`
    pub fn new(gateway: Gateway<Tokio>) -> Self {
        Self { gateway }
    }

    /// Search the network for an InternetGatewayDevice
    pub async fn search(config: &NatConfig) -> Result<Self> {
        let gateway = igd_next::aio::tokio::search_gateway(SearchOptions {
            timeout: Some(config.ssdp_timeout()),
            ..Default::default()
        })
        .await?;
        Ok(Self::new(gateway))
    }
}

#[async_trait]
impl UpnpControl for IgdNextClient {
    async fn gateway_address(&self) -> Result<IpAddr> {
        Ok(self.gateway.addr.ip())
    }

    async fn get_external_ip_address(&self) -> Result<String> {
        Ok(self.gateway.get_external_ip().await?.to_string())
    }

    async fn add_port_mapping(&self, request: &AddPortMapping<'_>) -> Result<()> {
        let protocol = to_igd_protocol(request.protocol)?;
        let internal_ip: IpAddr = request.internal_client.parse().map_err(|_| {
            NatError::Internal(format!("bad internal client {:?}", request.internal_client))
        })?;

        self.gateway
            .add_port(
                protocol,
                request.external_port,
                SocketAddr::new(internal_ip, request.internal_port),
                request.lease_secs,
                request.description,
            )
            .await?;
        Ok(())
    }

    async fn delete_port_mapping(
        &self,
        _remote_host: &str,
        external_port: u16,
        protocol: &str,
    ) -> Result<()> {
        let protocol = to_igd_protocol(protocol)?;
        self.gateway.remove_port(protocol, external_port).await?;
        Ok(())
    }

    async fn get_nat_rsip_status(&self) -> Result<RsipStatus> {
        Err(NatError::Upnp(
            "GetNATRSIPStatus is not available through igd-next".to_string(),
        ))
    }
}

/// Build a handle if the control client answers an external address query
pub async fn validate_generic(
    client: Box<dyn UpnpControl>,
    allocator: PortAllocator,
    interfaces: Arc<dyn InterfaceSource>,
) -> Option<UpnpHandle> {
    match client.get_external_ip_address().await {
        Ok(external) if external.trim().parse::<IpAddr>().is_ok() => {
            info!("Found UPnP gateway: {} (external {})", GENERIC_IGD_TYPE, external);
            Some(UpnpHandle::new(GENERIC_IGD_TYPE, client, allocator, interfaces))
        }
        Ok(external) => {
            debug!("Generic IGD reported unusable external address {:?}", external);
            None
        }
        Err(e) => {
            debug!("Generic IGD did not answer: {}", e);
            None
        }
    }
}

/// Discovery probe for any InternetGatewayDevice
pub struct GenericIgdProbe {
    config: NatConfig,
    interfaces: Arc<dyn InterfaceSource>,
}

impl GenericIgdProbe {
    /// Create the probe
    pub fn new(config: NatConfig, interfaces: Arc<dyn InterfaceSource>) -> Self {
        Self { config, interfaces }
    }

    async fn discover(&self) -> Option<UpnpHandle> {
        let client = match IgdNextClient::search(&self.config).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Generic IGD search failed: {}", e);
                return None;
            }
        };

        validate_generic(
            Box::new(client),
            PortAllocator::new(self.config.allocation),
            self.interfaces.clone(),
        )
        .await
    }
}

#[async_trait]
impl Probe for GenericIgdProbe {
    fn name(&self) -> &str {
        GENERIC_IGD_TYPE
    }

    async fn run(&self, cancel: CancellationToken) -> Option<Box<dyn NatHandle>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            handle = self.discover() => handle.map(|h| Box::new(h) as Box<dyn NatHandle>),
        }
    }
}
