//! SSDP search and device description parsing

use super::{DeviceFinder, SoapClient, UpnpControl};
use crate::config::NatConfig;
use crate::types::NatError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;
use xmltree::{Element, XMLNode};

/// SSDP multicast group and port
pub const SSDP_MULTICAST: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

/// A control service exposed somewhere in a root device's tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service type URN
    pub service_type: String,
    /// Absolute control URL
    pub control_url: Url,
}

/// A root device fetched from an SSDP `LOCATION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDevice {
    /// Description document location
    pub location: Url,
    /// `<URLBase>`, or the location when absent
    pub url_base: Url,
    /// Root device type URN
    pub device_type: String,
    /// Services of the root device and every embedded device
    pub services: Vec<ServiceInfo>,
}

/// Build an `M-SEARCH` request for `search_target`
pub fn search_request(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\r\n",
        search_target
    )
}

/// `LOCATION` of a search response, if it answers `search_target`
pub fn parse_search_response(data: &[u8], search_target: &str) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status = lines.next()?;
    if !status.starts_with("HTTP/1.1 200") && !status.starts_with("HTTP/1.0 200") {
        return None;
    }

    let mut location = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "location" => location = Some(value.to_string()),
            "st" if value != search_target => return None,
            _ => {}
        }
    }
    location
}

/// Multicast a search and collect distinct locations until `window` elapses
pub async fn search(search_target: &str, window: Duration) -> Result<Vec<String>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket
        .send_to(search_request(search_target).as_bytes(), SSDP_MULTICAST)
        .await?;

    let deadline = Instant::now() + window;
    let mut buf = [0u8; 2048];
    let mut locations: Vec<String> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if let Some(location) = parse_search_response(&buf[..len], search_target) {
                    if !locations.contains(&location) {
                        debug!("SSDP response from {}: {}", from, location);
                        locations.push(location);
                    }
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    Ok(locations)
}

fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    let text = element.get_child(name)?.get_text()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn collect_services(device: &Element, url_base: &Url, services: &mut Vec<ServiceInfo>) {
    if let Some(list) = device.get_child("serviceList") {
        for service in child_elements(list).filter(|e| e.name == "service") {
            let (Some(service_type), Some(control)) = (
                child_text(service, "serviceType"),
                child_text(service, "controlURL"),
            ) else {
                continue;
            };

            match url_base.join(&control) {
                Ok(control_url) => services.push(ServiceInfo {
                    service_type,
                    control_url,
                }),
                Err(e) => debug!("Ignoring service with bad control URL {}: {}", control, e),
            }
        }
    }

    if let Some(list) = device.get_child("deviceList") {
        for embedded in child_elements(list).filter(|e| e.name == "device") {
            collect_services(embedded, url_base, services);
        }
    }
}

/// Parse a root device description served at `location`
pub fn parse_description(xml: &[u8], location: &Url) -> Result<RootDevice> {
    let root = Element::parse(xml)?;

    let url_base = child_text(&root, "URLBase")
        .and_then(|base| Url::parse(&base).ok())
        .unwrap_or_else(|| location.clone());

    let device = root
        .get_child("device")
        .ok_or_else(|| NatError::Xml("description has no root device".to_string()))?;

    let mut services = Vec::new();
    collect_services(device, &url_base, &mut services);

    Ok(RootDevice {
        location: location.clone(),
        url_base,
        device_type: child_text(device, "deviceType").unwrap_or_default(),
        services,
    })
}

/// SSDP search plus HTTP description fetch, producing SOAP clients
pub struct SsdpFinder {
    http: reqwest::Client,
    window: Duration,
    soap_timeout: Duration,
}

impl SsdpFinder {
    /// Create a finder using the configured timeouts
    pub fn new(config: &NatConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            window: config.ssdp_timeout(),
            soap_timeout: config.soap_timeout(),
        }
    }

    async fn fetch(&self, location: &str) -> Result<RootDevice> {
        let url = Url::parse(location)
            .map_err(|e| NatError::Xml(format!("bad location {}: {}", location, e)))?;
        let body = self
            .http
            .get(url.clone())
            .timeout(self.soap_timeout)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_description(&body, &url)
    }
}

#[async_trait]
impl DeviceFinder for SsdpFinder {
    async fn discover_devices(&self, device_urn: &str) -> Result<Vec<RootDevice>> {
        let locations = search(device_urn, self.window).await?;
        debug!("{} device(s) answered {}", locations.len(), device_urn);

        let mut devices = Vec::new();
        for location in locations {
            match self.fetch(&location).await {
                Ok(device) => devices.push(device),
                Err(e) => debug!("Skipping device at {}: {}", location, e),
            }
        }
        Ok(devices)
    }

    fn connect(&self, device: &RootDevice, service: &ServiceInfo) -> Result<Box<dyn UpnpControl>> {
        Ok(Box::new(SoapClient::new(
            self.http.clone(),
            device.url_base.clone(),
            service.control_url.clone(),
            service.service_type.clone(),
            self.soap_timeout,
        )))
    }
}
