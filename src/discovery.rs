//! Discovery coordinator - races every backend probe against a deadline

use crate::config::NatConfig;
use crate::handle::NatHandle;
use crate::interfaces::{InterfaceSource, SystemInterfaces};
use crate::natpmp::NatPmpProbe;
use crate::types::NatError;
use crate::upnp::{DeviceFinder, GenericIgdProbe, SsdpFinder, UpnpProfileProbe, IG1, IG2};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One backend-specific attempt to find a live NAT gateway
#[async_trait]
pub trait Probe: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Look for a gateway, giving up promptly once `cancel` fires
    ///
    /// `None` means this backend found nothing; it is not an error.
    async fn run(&self, cancel: CancellationToken) -> Option<Box<dyn NatHandle>>;
}

/// Runs probes concurrently and keeps the first handle produced
pub struct Discovery {
    probes: Vec<Arc<dyn Probe>>,
    timeout: Duration,
}

impl Discovery {
    /// Coordinator with no probes and the given deadline
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            timeout,
        }
    }

    /// Add a probe to the race
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Coordinator with the probes enabled in `config`
    ///
    /// Fails if `config` does not validate.
    pub fn from_config(config: &NatConfig) -> Result<Self> {
        config.validate()?;
        let interfaces: Arc<dyn InterfaceSource> = Arc::new(SystemInterfaces);
        let finder: Arc<dyn DeviceFinder> = Arc::new(SsdpFinder::new(config));
        let mut discovery = Self::new(config.discovery_timeout());

        if config.probes.upnp_ig1 {
            discovery = discovery.with_probe(Arc::new(UpnpProfileProbe::new(
                &IG1,
                finder.clone(),
                config.clone(),
                interfaces.clone(),
            )));
        }
        if config.probes.upnp_ig2 {
            discovery = discovery.with_probe(Arc::new(UpnpProfileProbe::new(
                &IG2,
                finder.clone(),
                config.clone(),
                interfaces.clone(),
            )));
        }
        if config.probes.upnp_generic {
            discovery = discovery.with_probe(Arc::new(GenericIgdProbe::new(
                config.clone(),
                interfaces.clone(),
            )));
        }
        if config.probes.natpmp {
            discovery =
                discovery.with_probe(Arc::new(NatPmpProbe::new(config.clone(), interfaces)));
        }

        Ok(discovery)
    }

    /// Number of probes in the race
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Race all probes and return the first handle
    ///
    /// Fails with [`NatError::NoNatFound`] when the deadline passes, or earlier
    /// if every probe has already finished empty-handed. Probes still running
    /// when the race is decided are cancelled.
    pub async fn run(&self) -> Result<Box<dyn NatHandle>> {
        info!(
            "Discovering gateway with {} probe(s) (timeout: {:?})",
            self.probes.len(),
            self.timeout
        );

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for probe in &self.probes {
            let probe = probe.clone();
            let token = cancel.child_token();
            tasks.spawn(async move {
                let handle = probe.run(token).await;
                (probe.name().to_string(), handle)
            });
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("No gateway found within {:?}", self.timeout);
                    break Err(NatError::NoNatFound);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((name, Some(handle)))) => {
                        info!("Probe {} won discovery: {}", name, handle.backend_type());
                        break Ok(handle);
                    }
                    Some(Ok((name, None))) => debug!("Probe {} found nothing", name),
                    Some(Err(e)) => warn!("Probe task failed: {}", e),
                    None => {
                        warn!("All probes finished without a gateway");
                        break Err(NatError::NoNatFound);
                    }
                }
            }
        };

        cancel.cancel();
        tasks.abort_all();
        outcome
    }
}

/// Find a gateway with the default settings
///
/// ```no_run
/// use natmap::{discover_gateway, Protocol};
/// use std::time::Duration;
///
/// # async fn example() -> natmap::Result<()> {
/// let nat = discover_gateway().await?;
/// let pair = nat
///     .add_port_mapping(Protocol::Tcp, 0, 8080, "my service", Duration::from_secs(3600))
///     .await?;
/// println!("{} forwards {} -> {}", nat.backend_type(), pair.external, pair.internal);
/// # Ok(())
/// # }
/// ```
pub async fn discover_gateway() -> Result<Box<dyn NatHandle>> {
    discover_gateway_with(&NatConfig::default()).await
}

/// Find a gateway with custom settings
pub async fn discover_gateway_with(config: &NatConfig) -> Result<Box<dyn NatHandle>> {
    Discovery::from_config(config)?.run().await
}
