//! Local interface enumeration and gateway subnet matching

use crate::types::NatError;
use crate::Result;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// One address bound to a local network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Interface name, e.g. `eth0`
    pub name: String,
    /// Address bound to the interface
    pub ip: IpAddr,
    /// Subnet mask of that address
    pub netmask: IpAddr,
}

impl InterfaceAddress {
    /// Create an interface address
    pub fn new(name: impl Into<String>, ip: IpAddr, netmask: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
            netmask,
        }
    }

    /// Whether `addr` lies in this address's subnet
    pub fn contains(&self, addr: &IpAddr) -> bool {
        IpNet::with_netmask(self.ip, self.netmask)
            .map(|net| net.contains(addr))
            .unwrap_or(false)
    }
}

/// Source of local interface addresses
pub trait InterfaceSource: Send + Sync + fmt::Debug {
    /// All addresses on all local interfaces
    fn addresses(&self) -> Result<Vec<InterfaceAddress>>;
}

/// Interfaces of the running host, via `if-addrs`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn addresses(&self) -> Result<Vec<InterfaceAddress>> {
        let addresses = if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => {
                    InterfaceAddress::new(iface.name, v4.ip.into(), v4.netmask.into())
                }
                if_addrs::IfAddr::V6(v6) => {
                    InterfaceAddress::new(iface.name, v6.ip.into(), v6.netmask.into())
                }
            })
            .collect();
        Ok(addresses)
    }
}

/// Address of the first local interface whose subnet contains `gateway`
pub fn internal_address_for(gateway: IpAddr, source: &dyn InterfaceSource) -> Result<IpAddr> {
    let found = source
        .addresses()?
        .into_iter()
        .find(|addr| addr.contains(&gateway));

    match found {
        Some(addr) => {
            debug!(
                "Gateway {} is reachable through {} ({})",
                gateway, addr.name, addr.ip
            );
            Ok(addr.ip)
        }
        None => Err(NatError::NoInternalAddress(gateway)),
    }
}
