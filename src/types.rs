//! Common types shared by the discovery coordinator and the backends

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP mapping
    Tcp,
    /// UDP mapping
    Udp,
}

impl Protocol {
    /// Protocol name as UPnP `AddPortMapping`/`DeletePortMapping` expect it
    pub fn upnp_name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = NatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(NatError::InvalidProtocol(s.to_string())),
        }
    }
}

/// A bound (external, internal) port pair returned by `add_port_mapping`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortPair {
    /// Port opened on the gateway
    pub external: u16,
    /// Port on the local host that receives the traffic
    pub internal: u16,
}

impl PortPair {
    /// Create a new port pair
    pub fn new(external: u16, internal: u16) -> Self {
        Self { external, internal }
    }
}

impl From<PortPair> for (u16, u16) {
    fn from(pair: PortPair) -> Self {
        (pair.external, pair.internal)
    }
}

/// Errors produced by discovery and port mapping
///
/// The first group is synthesized locally. The rest carry whatever the wire
/// collaborator reported, without reinterpretation.
#[derive(Debug, Error)]
pub enum NatError {
    /// Every randomly drawn external port was already in the local cache
    #[error("failed to find available external port")]
    NoAvailableExternalPort,

    /// The external port is cached against a different internal port
    #[error(
        "external port {external_port} is mapped to internal port {existing_internal_port}, not {requested_internal_port}"
    )]
    ExternalPortInUse {
        /// External port that was requested
        external_port: u16,
        /// Internal port the cache already holds for it
        existing_internal_port: u16,
        /// Internal port the caller asked for
        requested_internal_port: u16,
    },

    /// The gateway reply could not be parsed as an IP address
    #[error("no external address: {0:?}")]
    NoExternalAddress(String),

    /// No local interface shares a subnet with the gateway
    #[error("no internal address on the subnet of gateway {0}")]
    NoInternalAddress(IpAddr),

    /// No probe produced a gateway before the discovery deadline
    #[error("no NAT found")]
    NoNatFound,

    /// Protocol string other than "tcp" or "udp"
    #[error("invalid protocol: {0:?}")]
    InvalidProtocol(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// UPnP fault returned by the control service
    #[error("UPnP error {code}: {description}")]
    Soap {
        /// UPnP error code
        code: u16,
        /// UPnP error description
        description: String,
    },

    /// HTTP failure talking to a UPnP device
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unparseable device description or SOAP envelope
    #[error("XML error: {0}")]
    Xml(String),

    /// Error reported by the igd-next gateway client
    #[error("UPnP gateway error: {0}")]
    Upnp(String),

    /// Error reported by the NAT-PMP client
    #[error("NAT-PMP error: {0}")]
    NatPmp(String),

    /// Retransmissions exhausted without a reply
    #[error("request timed out")]
    Timeout,

    /// The operating system reports no default gateway
    #[error("no default gateway")]
    NoGateway,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<igd_next::SearchError> for NatError {
    fn from(error: igd_next::SearchError) -> Self {
        Self::Upnp(error.to_string())
    }
}

impl From<igd_next::GetExternalIpError> for NatError {
    fn from(error: igd_next::GetExternalIpError) -> Self {
        Self::Upnp(error.to_string())
    }
}

impl From<igd_next::AddPortError> for NatError {
    fn from(error: igd_next::AddPortError) -> Self {
        Self::Upnp(error.to_string())
    }
}

impl From<igd_next::RemovePortError> for NatError {
    fn from(error: igd_next::RemovePortError) -> Self {
        Self::Upnp(error.to_string())
    }
}

impl From<::natpmp::Error> for NatError {
    fn from(error: ::natpmp::Error) -> Self {
        Self::NatPmp(format!("{:?}", error))
    }
}

impl From<xmltree::ParseError> for NatError {
    fn from(error: xmltree::ParseError) -> Self {
        Self::Xml(error.to_string())
    }
}
