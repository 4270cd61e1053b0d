//! natmap - automatic gateway discovery and port mapping
//!
//! This library finds the NAT gateway in front of the host and opens port
//! forwards on it, so external peers can reach a local service without manual
//! router configuration. Two unrelated protocols sit behind one interface:
//! - UPnP IGD (InternetGatewayDevice:1, InternetGatewayDevice:2 and a generic
//!   IGD search)
//! - NAT-PMP (RFC 6886)
//!
//! [`discover_gateway`] races one probe per backend and returns the first
//! [`NatHandle`]; the handle then creates, renews and removes mappings.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod config;
pub mod discovery;
pub mod gateway;
pub mod handle;
pub mod interfaces;
pub mod natpmp;
pub mod types;
pub mod upnp;

#[cfg(test)]
mod tests;

pub use allocator::{MappingBackend, PortAllocator};
pub use config::{AllocationConfig, NatConfig, ProbeSelection};
pub use discovery::{discover_gateway, discover_gateway_with, Discovery, Probe};
pub use handle::NatHandle;
pub use interfaces::{InterfaceAddress, InterfaceSource, SystemInterfaces};
pub use types::{NatError, PortPair, Protocol};

/// Result type alias for natmap operations
pub type Result<T> = std::result::Result<T, NatError>;

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`)
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
