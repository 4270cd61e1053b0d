//! NAT-PMP (NAT Port Mapping Protocol) backend - RFC 6886
//!
//! NAT-PMP talks UDP to the default gateway on port 5351. It has no device
//! discovery of its own: the probe resolves the OS default route, builds a
//! client for it and treats a successful external address query as proof that
//! a NAT-PMP gateway is listening.

use crate::allocator::{lease_seconds, MappingBackend, PortAllocator};
use crate::config::NatConfig;
use crate::discovery::Probe;
use crate::gateway::default_gateway;
use crate::handle::NatHandle;
use crate::interfaces::{internal_address_for, InterfaceSource};
use crate::types::{NatError, PortPair, Protocol};
use crate::Result;
use async_trait::async_trait;
use ::natpmp::{NatpmpAsync, Response};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Type string of handles produced by this backend
pub const NATPMP_TYPE: &str = "NAT-PMP";

/// Reply to a mapping request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingReply {
    /// Internal port the gateway mapped
    pub internal_port: u16,
    /// External port the gateway assigned
    pub external_port: u16,
    /// Lifetime granted by the gateway
    pub lifetime_secs: u32,
}

/// Commands the NAT-PMP backend needs from a protocol client
#[async_trait]
pub trait NatPmpClient: Send + Sync {
    /// Ask the gateway for its public address
    async fn external_address(&self) -> Result<Ipv4Addr>;

    /// Create, renew or (with `lifetime_secs == 0`) delete a mapping
    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<MappingReply>;
}

enum Request {
    PublicAddress,
    Mapping {
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    },
}

/// NAT-PMP client on a tokio UDP socket
///
/// Requests are serialized and retransmitted with a doubling timeout until
/// the configured number of attempts is used up.
pub struct TokioNatPmpClient {
    inner: Mutex<NatpmpAsync<UdpSocket>>,
    initial_timeout: Duration,
    max_attempts: u32,
}

impl TokioNatPmpClient {
    /// Create a client for `gateway`
    pub async fn connect(gateway: Ipv4Addr, config: &NatConfig) -> Result<Self> {
        let inner = ::natpmp::new_tokio_natpmp_with(gateway).await?;
        Ok(Self {
            inner: Mutex::new(inner),
            initial_timeout: config.natpmp_initial_timeout(),
            max_attempts: config.natpmp_max_attempts,
        })
    }

    async fn exchange<T: Send>(
        &self,
        request: Request,
        accept: impl Fn(Response) -> Option<T> + Send,
    ) -> Result<T> {
        let mut client = self.inner.lock().await;
        let mut wait = self.initial_timeout;

        for attempt in 1..=self.max_attempts {
            match &request {
                Request::PublicAddress => client.send_public_address_request().await?,
                Request::Mapping {
                    protocol,
                    internal_port,
                    external_port,
                    lifetime_secs,
                } => {
                    client
                        .send_port_mapping_request(
                            to_natpmp_protocol(*protocol),
                            *internal_port,
                            *external_port,
                            *lifetime_secs,
                        )
                        .await?
                }
            }

            let deadline = Instant::now() + wait;
            loop {
                match tokio::time::timeout_at(deadline, client.read_response_or_retry()).await {
                    Ok(Ok(response)) => {
                        if let Some(value) = accept(response) {
                            return Ok(value);
                        }
                        // Late reply to an earlier request; keep waiting.
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => break,
                }
            }

            debug!(
                "NAT-PMP request unanswered after {:?} (attempt {}/{})",
                wait, attempt, self.max_attempts
            );
            wait *= 2;
        }

        Err(NatError::Timeout)
    }
}

#[async_trait]
impl NatPmpClient for TokioNatPmpClient {
    async fn external_address(&self) -> Result<Ipv4Addr> {
        self.exchange(Request::PublicAddress, |response| match response {
            Response::Gateway(gateway) => Some(*gateway.public_address()),
            _ => None,
        })
        .await
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<MappingReply> {
        let request = Request::Mapping {
            protocol,
            internal_port,
            external_port,
            lifetime_secs,
        };

        self.exchange(request, move |response| {
            let mapping = match (response, protocol) {
                (Response::TCP(m), Protocol::Tcp) | (Response::UDP(m), Protocol::Udp) => m,
                _ => return None,
            };
            (mapping.private_port() == internal_port).then(|| MappingReply {
                internal_port: mapping.private_port(),
                external_port: mapping.public_port(),
                lifetime_secs: u32::try_from(mapping.lifetime().as_secs()).unwrap_or(u32::MAX),
            })
        })
        .await
    }
}

fn to_natpmp_protocol(protocol: Protocol) -> ::natpmp::Protocol {
    match protocol {
        Protocol::Tcp => ::natpmp::Protocol::TCP,
        Protocol::Udp => ::natpmp::Protocol::UDP,
    }
}

struct PmpBinder<'a> {
    client: &'a dyn NatPmpClient,
}

#[async_trait]
impl MappingBackend for PmpBinder<'_> {
    async fn bind(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        _description: &str,
        lease_secs: u32,
    ) -> Result<()> {
        let reply = self
            .client
            .add_port_mapping(protocol, internal_port, external_port, lease_secs)
            .await?;

        if reply.external_port != external_port {
            warn!(
                "NAT-PMP gateway assigned external port {} instead of {}",
                reply.external_port, external_port
            );
        }
        Ok(())
    }
}

/// A gateway reached over NAT-PMP
pub struct NatPmpHandle {
    client: Box<dyn NatPmpClient>,
    gateway: Ipv4Addr,
    interfaces: Arc<dyn InterfaceSource>,
    allocator: Mutex<PortAllocator>,
}

impl NatPmpHandle {
    /// Wrap a client for `gateway`
    pub fn new(
        client: Box<dyn NatPmpClient>,
        gateway: Ipv4Addr,
        allocator: PortAllocator,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Self {
        Self {
            client,
            gateway,
            interfaces,
            allocator: Mutex::new(allocator),
        }
    }

    /// Build a handle if the gateway answers an external address query
    pub async fn validate(
        client: Box<dyn NatPmpClient>,
        gateway: Ipv4Addr,
        allocator: PortAllocator,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Option<Self> {
        match client.external_address().await {
            Ok(external) => {
                info!("NAT-PMP gateway {} is live (external {})", gateway, external);
                Some(Self::new(client, gateway, allocator, interfaces))
            }
            Err(e) => {
                debug!("NAT-PMP gateway {} did not answer: {}", gateway, e);
                None
            }
        }
    }
}

#[async_trait]
impl NatHandle for NatPmpHandle {
    fn backend_type(&self) -> &str {
        NATPMP_TYPE
    }

    async fn device_address(&self) -> Result<IpAddr> {
        Ok(IpAddr::V4(self.gateway))
    }

    async fn external_address(&self) -> Result<IpAddr> {
        Ok(IpAddr::V4(self.client.external_address().await?))
    }

    async fn internal_address(&self) -> Result<IpAddr> {
        internal_address_for(IpAddr::V4(self.gateway), self.interfaces.as_ref())
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<PortPair> {
        let binder = PmpBinder {
            client: self.client.as_ref(),
        };
        let mut allocator = self.allocator.lock().await;
        let pair = allocator
            .allocate(&binder, protocol, external_port, internal_port, description, lease)
            .await?;

        info!(
            "NAT-PMP {} mapping {} -> {} ({}s)",
            protocol,
            pair.external,
            pair.internal,
            lease_seconds(lease)
        );
        Ok(pair)
    }

    async fn delete_port_mapping(&self, protocol: Protocol, external_port: u16) -> Result<()> {
        let mut allocator = self.allocator.lock().await;
        let Some(internal_port) = allocator.release(external_port) else {
            return Ok(());
        };

        // RFC 6886: lifetime 0 with external port 0 removes the mapping.
        debug!(
            "Deleting NAT-PMP {} mapping {} -> {}",
            protocol, external_port, internal_port
        );
        self.client
            .add_port_mapping(protocol, internal_port, 0, 0)
            .await?;
        Ok(())
    }

    async fn mappings(&self) -> Vec<PortPair> {
        self.allocator.lock().await.mappings()
    }
}

/// Discovery probe for a NAT-PMP gateway on the default route
pub struct NatPmpProbe {
    config: NatConfig,
    interfaces: Arc<dyn InterfaceSource>,
}

impl NatPmpProbe {
    /// Create the probe
    pub fn new(config: NatConfig, interfaces: Arc<dyn InterfaceSource>) -> Self {
        Self { config, interfaces }
    }

    async fn discover(&self) -> Option<NatPmpHandle> {
        let gateway = match default_gateway().await {
            Ok(gateway) => gateway,
            Err(e) => {
                debug!("NAT-PMP probe has no gateway: {}", e);
                return None;
            }
        };

        let client = match TokioNatPmpClient::connect(gateway, &self.config).await {
            Ok(client) => client,
            Err(e) => {
                debug!("NAT-PMP client for {} failed: {}", gateway, e);
                return None;
            }
        };

        NatPmpHandle::validate(
            Box::new(client),
            gateway,
            PortAllocator::new(self.config.allocation),
            self.interfaces.clone(),
        )
        .await
    }
}

#[async_trait]
impl Probe for NatPmpProbe {
    fn name(&self) -> &str {
        NATPMP_TYPE
    }

    async fn run(&self, cancel: CancellationToken) -> Option<Box<dyn NatHandle>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            handle = self.discover() => handle.map(|h| Box::new(h) as Box<dyn NatHandle>),
        }
    }
}
