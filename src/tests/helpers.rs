//! Scripted backends and fixtures shared by the test modules

use crate::allocator::{MappingBackend, PortAllocator};
use crate::config::AllocationConfig;
use crate::interfaces::{InterfaceAddress, InterfaceSource};
use crate::natpmp::{MappingReply, NatPmpClient};
use crate::types::{NatError, Protocol};
use crate::upnp::{AddPortMapping, RsipStatus, UpnpControl};
use crate::Result;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One bind request seen by a scripted backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindCall {
    pub protocol: Protocol,
    pub external: u16,
    pub internal: u16,
    pub client: String,
    pub description: String,
    pub lease_secs: u32,
}

/// Shared record of everything a scripted backend was asked to do
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    binds: Arc<Mutex<Vec<BindCall>>>,
    deletes: Arc<Mutex<Vec<(u16, String)>>>,
    rsip_queries: Arc<Mutex<Vec<String>>>,
    rejections: Arc<AtomicUsize>,
}

impl CallLog {
    /// Log whose backend rejects the first `n` binds
    pub fn rejecting(n: usize) -> Self {
        let log = Self::default();
        log.rejections.store(n, Ordering::SeqCst);
        log
    }

    pub fn reject_next(&self, n: usize) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    pub fn binds(&self) -> Vec<BindCall> {
        self.binds.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<(u16, String)> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn rsip_queries(&self) -> Vec<String> {
        self.rsip_queries.lock().unwrap().clone()
    }

    fn record_bind(&self, call: BindCall) -> Result<()> {
        self.binds.lock().unwrap().push(call);
        let rejected = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            Err(NatError::Soap {
                code: 718,
                description: "ConflictInMappingEntry".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Backend for exercising the allocator on its own
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pub log: CallLog,
}

impl ScriptedBackend {
    pub fn rejecting(n: usize) -> Self {
        Self {
            log: CallLog::rejecting(n),
        }
    }
}

#[async_trait]
impl MappingBackend for ScriptedBackend {
    async fn bind(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease_secs: u32,
    ) -> Result<()> {
        self.log.record_bind(BindCall {
            protocol,
            external: external_port,
            internal: internal_port,
            client: String::new(),
            description: description.to_string(),
            lease_secs,
        })
    }
}

/// NAT-PMP client answering from memory
#[derive(Debug)]
pub struct MockPmpClient {
    pub external: Option<Ipv4Addr>,
    /// External port the gateway hands out instead of the requested one
    pub assigned_external: Option<u16>,
    pub log: CallLog,
}

impl MockPmpClient {
    pub fn new(external: Option<Ipv4Addr>, log: CallLog) -> Self {
        Self {
            external,
            assigned_external: None,
            log,
        }
    }
}

#[async_trait]
impl NatPmpClient for MockPmpClient {
    async fn external_address(&self) -> Result<Ipv4Addr> {
        self.external.ok_or(NatError::Timeout)
    }

    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<MappingReply> {
        self.log.record_bind(BindCall {
            protocol,
            external: external_port,
            internal: internal_port,
            client: String::new(),
            description: String::new(),
            lease_secs: lifetime_secs,
        })?;
        Ok(MappingReply {
            internal_port,
            external_port: self.assigned_external.unwrap_or(external_port),
            lifetime_secs,
        })
    }
}

/// UPnP control client answering from memory
#[derive(Debug, Clone)]
pub struct MockUpnp {
    pub gateway: IpAddr,
    pub external_ip: String,
    pub nat_enabled: bool,
    pub label: String,
    pub log: CallLog,
}

impl MockUpnp {
    pub fn new(gateway: IpAddr, external_ip: &str, log: CallLog) -> Self {
        Self {
            gateway,
            external_ip: external_ip.to_string(),
            nat_enabled: true,
            label: String::new(),
            log,
        }
    }
}

#[async_trait]
impl UpnpControl for MockUpnp {
    async fn gateway_address(&self) -> Result<IpAddr> {
        Ok(self.gateway)
    }

    async fn get_external_ip_address(&self) -> Result<String> {
        Ok(self.external_ip.clone())
    }

    async fn add_port_mapping(&self, request: &AddPortMapping<'_>) -> Result<()> {
        let protocol = request.protocol.parse()?;
        self.log.record_bind(BindCall {
            protocol,
            external: request.external_port,
            internal: request.internal_port,
            client: request.internal_client.to_string(),
            description: request.description.to_string(),
            lease_secs: request.lease_secs,
        })
    }

    async fn delete_port_mapping(
        &self,
        _remote_host: &str,
        external_port: u16,
        protocol: &str,
    ) -> Result<()> {
        self.log
            .deletes
            .lock()
            .unwrap()
            .push((external_port, protocol.to_string()));
        Ok(())
    }

    async fn get_nat_rsip_status(&self) -> Result<RsipStatus> {
        self.log.rsip_queries.lock().unwrap().push(self.label.clone());
        Ok(RsipStatus {
            rsip_available: false,
            nat_enabled: self.nat_enabled,
        })
    }
}

/// Fixed list of interface addresses
#[derive(Debug, Default)]
pub struct StaticInterfaces(pub Vec<InterfaceAddress>);

impl StaticInterfaces {
    /// A single IPv4 interface `ip/prefix`
    pub fn single(ip: [u8; 4], netmask: [u8; 4]) -> Arc<dyn InterfaceSource> {
        Arc::new(Self(vec![InterfaceAddress::new(
            "eth0",
            IpAddr::V4(Ipv4Addr::from(ip)),
            IpAddr::V4(Ipv4Addr::from(netmask)),
        )]))
    }
}

impl InterfaceSource for StaticInterfaces {
    fn addresses(&self) -> Result<Vec<InterfaceAddress>> {
        Ok(self.0.clone())
    }
}

pub fn seeded_allocator(seed: u64) -> PortAllocator {
    PortAllocator::with_seed(AllocationConfig::default(), seed)
}

pub fn lan_gateway() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}
