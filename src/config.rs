//! Discovery and allocation settings

use crate::{NatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for gateway discovery and the backends it produces
///
/// All fields have defaults, so a partial JSON document is enough:
///
/// ```rust
/// use natmap::NatConfig;
///
/// let config = NatConfig::from_json(r#"{ "discovery_timeout_secs": 3 }"#).unwrap();
/// assert_eq!(config.discovery_timeout().as_secs(), 3);
/// assert!(config.probes.natpmp);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Global budget for the discovery race in seconds
    pub discovery_timeout_secs: u64,
    /// How long each SSDP search collects responses, in milliseconds
    pub ssdp_timeout_ms: u64,
    /// Per-request timeout for SOAP control calls, in milliseconds
    pub soap_timeout_ms: u64,
    /// First NAT-PMP retransmission timeout in milliseconds (doubles each try)
    pub natpmp_initial_timeout_ms: u64,
    /// NAT-PMP send attempts before giving up
    pub natpmp_max_attempts: u32,
    /// Which probes take part in discovery
    pub probes: ProbeSelection,
    /// Port allocation policy
    pub allocation: AllocationConfig,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 10,
            ssdp_timeout_ms: 2000,
            soap_timeout_ms: 5000,
            natpmp_initial_timeout_ms: 250,
            natpmp_max_attempts: 4,
            probes: ProbeSelection::default(),
            allocation: AllocationConfig::default(),
        }
    }
}

impl NatConfig {
    /// Parse settings from JSON and validate them
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| NatError::InvalidConfig(format!("failed to parse settings: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize settings to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| NatError::InvalidConfig(format!("failed to serialize settings: {}", e)))
    }

    /// Reject settings no backend can work with
    pub fn validate(&self) -> Result<()> {
        if self.discovery_timeout_secs == 0 {
            return Err(NatError::InvalidConfig(
                "discovery_timeout_secs must be positive".to_string(),
            ));
        }
        if self.ssdp_timeout_ms == 0 || self.soap_timeout_ms == 0 {
            return Err(NatError::InvalidConfig(
                "UPnP timeouts must be positive".to_string(),
            ));
        }
        if self.natpmp_initial_timeout_ms == 0 || self.natpmp_max_attempts == 0 {
            return Err(NatError::InvalidConfig(
                "NAT-PMP retransmission schedule must be positive".to_string(),
            ));
        }
        self.allocation.validate()
    }

    /// Global discovery deadline
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// SSDP response window
    pub fn ssdp_timeout(&self) -> Duration {
        Duration::from_millis(self.ssdp_timeout_ms)
    }

    /// SOAP request timeout
    pub fn soap_timeout(&self) -> Duration {
        Duration::from_millis(self.soap_timeout_ms)
    }

    /// First NAT-PMP retransmission timeout
    pub fn natpmp_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.natpmp_initial_timeout_ms)
    }
}

/// Enables or disables each of the four discovery probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSelection {
    /// UPnP InternetGatewayDevice:1 WAN connection profile
    pub upnp_ig1: bool,
    /// UPnP InternetGatewayDevice:2 WAN connection profile
    pub upnp_ig2: bool,
    /// Generic IGD search through igd-next
    pub upnp_generic: bool,
    /// NAT-PMP against the default gateway
    pub natpmp: bool,
}

impl Default for ProbeSelection {
    fn default() -> Self {
        Self {
            upnp_ig1: true,
            upnp_ig2: true,
            upnp_generic: true,
            natpmp: true,
        }
    }
}

/// Randomized port allocation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// First port of the ephemeral range (inclusive)
    pub port_range_start: u16,
    /// End of the ephemeral range (exclusive)
    pub port_range_end: u16,
    /// Random draws when picking an external port
    pub external_port_attempts: u32,
    /// Backend bind attempts when picking an internal port
    pub internal_port_attempts: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            port_range_start: 10000,
            port_range_end: u16::MAX,
            external_port_attempts: 100,
            internal_port_attempts: 3,
        }
    }
}

impl AllocationConfig {
    /// Reject empty ranges and zero attempt counts
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 || self.port_range_start >= self.port_range_end {
            return Err(NatError::InvalidConfig(format!(
                "empty port range [{}, {})",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.external_port_attempts == 0 || self.internal_port_attempts == 0 {
            return Err(NatError::InvalidConfig(
                "allocation attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
