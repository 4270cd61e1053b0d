//! Port mapping allocation shared by every backend
//!
//! A backend only knows how to ask its gateway for one concrete
//! `(external, internal)` binding. [`PortAllocator`] turns a caller request,
//! where either port may be `0` for "pick one", into such bindings:
//!
//! 1. An unset external port is drawn at random from the ephemeral range,
//!    avoiding ports already in the local cache.
//! 2. A cached external port is renewed with the cached internal port, or
//!    rejected with [`NatError::ExternalPortInUse`] if the caller asks for a
//!    different one.
//! 3. A new external port is bound once with an explicit internal port, or up
//!    to `internal_port_attempts` times with fresh random internal ports.
//!
//! The cache is a local hint. It is never reconciled with the gateway, which
//! may expire or drop mappings on its own.

use crate::config::AllocationConfig;
use crate::types::{NatError, PortPair, Protocol};
use crate::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// The single wire operation the allocator needs from a backend
#[async_trait]
pub trait MappingBackend: Send + Sync {
    /// Create or renew one concrete mapping on the gateway
    async fn bind(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease_secs: u32,
    ) -> Result<()>;
}

/// Lease duration in whole seconds, saturating at `u32::MAX`
pub fn lease_seconds(lease: Duration) -> u32 {
    u32::try_from(lease.as_secs()).unwrap_or(u32::MAX)
}

/// Local external -> internal port cache plus the random source used to fill it
#[derive(Debug)]
pub struct PortAllocator {
    ports: HashMap<u16, u16>,
    rng: StdRng,
    config: AllocationConfig,
}

impl PortAllocator {
    /// Create an allocator seeded from OS entropy
    pub fn new(config: AllocationConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create an allocator with a deterministic seed
    pub fn with_seed(config: AllocationConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    /// Create an allocator around an existing generator
    pub fn with_rng(config: AllocationConfig, rng: StdRng) -> Self {
        Self {
            ports: HashMap::new(),
            rng,
            config,
        }
    }

    /// Draw a port uniformly from the configured range
    ///
    /// Fails with [`NatError::InvalidConfig`] when the range is empty.
    pub fn random_port(&mut self) -> Result<u16> {
        let range = self.config.port_range_start..self.config.port_range_end;
        if range.is_empty() {
            return Err(NatError::InvalidConfig(format!(
                "empty port range [{}, {})",
                range.start, range.end
            )));
        }
        Ok(self.rng.gen_range(range))
    }

    /// Pick an external port that is not in the local cache
    pub fn pick_external_port(&mut self) -> Result<u16> {
        for _ in 0..self.config.external_port_attempts {
            let candidate = self.random_port()?;
            if !self.ports.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        warn!(
            "No free external port after {} draws ({} cached)",
            self.config.external_port_attempts,
            self.ports.len()
        );
        Err(NatError::NoAvailableExternalPort)
    }

    /// Resolve a mapping request against the cache and bind it on `backend`
    ///
    /// On any error the cache is left exactly as it was.
    pub async fn allocate<B: MappingBackend + ?Sized>(
        &mut self,
        backend: &B,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<PortPair> {
        let lease_secs = lease_seconds(lease);

        let external_port = if external_port == 0 {
            self.pick_external_port()?
        } else {
            external_port
        };

        if let Some(&existing) = self.ports.get(&external_port) {
            let internal_port = if internal_port == 0 {
                existing
            } else {
                internal_port
            };

            if internal_port != existing {
                return Err(NatError::ExternalPortInUse {
                    external_port,
                    existing_internal_port: existing,
                    requested_internal_port: internal_port,
                });
            }

            debug!(
                "Renewing {} mapping {} -> {} ({}s)",
                protocol, external_port, internal_port, lease_secs
            );
            backend
                .bind(protocol, external_port, internal_port, description, lease_secs)
                .await?;
            return Ok(PortPair::new(external_port, internal_port));
        }

        let attempts = if internal_port == 0 {
            self.config.internal_port_attempts
        } else {
            1
        };

        let mut last_error = None;
        for attempt in 1..=attempts {
            let candidate = if internal_port == 0 {
                self.random_port()?
            } else {
                internal_port
            };

            debug!(
                "Binding {} mapping {} -> {} (attempt {}/{})",
                protocol, external_port, candidate, attempt, attempts
            );
            match backend
                .bind(protocol, external_port, candidate, description, lease_secs)
                .await
            {
                Ok(()) => {
                    self.ports.insert(external_port, candidate);
                    return Ok(PortPair::new(external_port, candidate));
                }
                Err(e) => {
                    debug!("Bind of {} -> {} rejected: {}", external_port, candidate, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            NatError::Internal("no bind attempt was made".to_string())
        }))
    }

    /// Forget a cached mapping, returning its internal port
    pub fn release(&mut self, external_port: u16) -> Option<u16> {
        self.ports.remove(&external_port)
    }

    /// Internal port cached for `external_port`
    pub fn get(&self, external_port: u16) -> Option<u16> {
        self.ports.get(&external_port).copied()
    }

    /// Snapshot of the cache, ordered by external port
    pub fn mappings(&self) -> Vec<PortPair> {
        let mut pairs: Vec<PortPair> = self
            .ports
            .iter()
            .map(|(&external, &internal)| PortPair::new(external, internal))
            .collect();
        pairs.sort_by_key(|pair| pair.external);
        pairs
    }

    /// Number of cached mappings
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
