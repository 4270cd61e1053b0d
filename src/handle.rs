//! The contract every discovered gateway satisfies

use crate::types::{PortPair, Protocol};
use crate::Result;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// One discovered gateway, valid for the lifetime of a discovery session
///
/// A handle owns its wire client and a private cache of the mappings this
/// process created through it. Calls on one handle are serialized internally,
/// so it can be shared behind an `Arc` across tasks. Dropping a handle does not
/// remove anything from the gateway; open leases expire on their own.
#[async_trait]
pub trait NatHandle: Send + Sync {
    /// Backend and profile that produced this handle, e.g. `"NAT-PMP"`
    fn backend_type(&self) -> &str;

    /// Address of the gateway device itself
    async fn device_address(&self) -> Result<IpAddr>;

    /// Public address reported by the gateway
    async fn external_address(&self) -> Result<IpAddr>;

    /// Address of the first local interface whose subnet contains the gateway
    async fn internal_address(&self) -> Result<IpAddr>;

    /// Map `external_port` on the gateway to `internal_port` on this host
    ///
    /// Either port may be `0` to let the handle choose. Returns the pair that
    /// was requested from the gateway, which is also what the handle caches.
    /// A NAT-PMP gateway may assign a different external port than requested;
    /// that is logged as a warning and not reflected in the returned pair.
    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<PortPair>;

    /// Remove a mapping created through this handle
    ///
    /// Unknown ports are a no-op.
    async fn delete_port_mapping(&self, protocol: Protocol, external_port: u16) -> Result<()>;

    /// Mappings this handle currently believes are open
    async fn mappings(&self) -> Vec<PortPair>;
}
