//! SOAP control client for WAN IP/PPP connection services

use super::{AddPortMapping, RsipStatus, UpnpControl};
use crate::types::NatError;
use crate::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use xmltree::Element;

/// Escape text for an XML element body
pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// SOAP envelope invoking `action` of `service_type`
pub fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut body = String::new();
    for (name, value) in args {
        body.push_str(&format!("<{name}>{}</{name}>", escape_xml(value)));
    }

    format!(
        "<?xml version=\"1.0\"?>\r\n\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service_type}\">{body}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

fn body_of(xml: &[u8]) -> Result<Element> {
    let envelope = Element::parse(xml)?;
    envelope
        .get_child("Body")
        .cloned()
        .ok_or_else(|| NatError::Xml("SOAP envelope has no body".to_string()))
}

/// The `<{action}Response>` element of a successful reply
pub fn parse_response(xml: &[u8], action: &str) -> Result<Element> {
    let response = format!("{}Response", action);
    body_of(xml)?
        .get_child(response.as_str())
        .cloned()
        .ok_or_else(|| NatError::Xml(format!("reply has no {} element", response)))
}

/// The UPnP error carried by a SOAP fault, if any
pub fn parse_fault(xml: &[u8]) -> Option<NatError> {
    let body = body_of(xml).ok()?;
    let error = body
        .get_child("Fault")?
        .get_child("detail")?
        .get_child("UPnPError")?;

    let code = error.get_child("errorCode")?.get_text()?.trim().parse().ok()?;
    let description = error
        .get_child("errorDescription")
        .and_then(|e| e.get_text())
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    Some(NatError::Soap { code, description })
}

/// Text of an output argument, empty when absent
pub fn argument(response: &Element, name: &str) -> String {
    response
        .get_child(name)
        .and_then(|e| e.get_text())
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes")
}

/// Resolve the host of `url` to an IPv4 address
pub async fn resolve_host(url: &Url) -> Result<IpAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| NatError::Internal(format!("{} has no host", url)))?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    tokio::net::lookup_host((host, port))
        .await?
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| NatError::Internal(format!("{} does not resolve to IPv4", host)))
}

/// Control client for one WAN connection service
#[derive(Debug, Clone)]
pub struct SoapClient {
    http: reqwest::Client,
    url_base: Url,
    control_url: Url,
    service_type: String,
    timeout: Duration,
}

impl SoapClient {
    /// Create a client posting to `control_url`
    pub fn new(
        http: reqwest::Client,
        url_base: Url,
        control_url: Url,
        service_type: String,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            url_base,
            control_url,
            service_type,
            timeout,
        }
    }

    async fn call(&self, action: &str, args: &[(&str, String)]) -> Result<Element> {
        debug!("SOAP {} -> {}", action, self.control_url);
        let response = self
            .http
            .post(self.control_url.clone())
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", self.service_type, action))
            .body(envelope(&self.service_type, action, args))
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(parse_fault(&body).unwrap_or_else(|| NatError::Soap {
                code: status.as_u16(),
                description: status.canonical_reason().unwrap_or("HTTP error").to_string(),
            }));
        }

        parse_response(&body, action)
    }
}

#[async_trait]
impl UpnpControl for SoapClient {
    async fn gateway_address(&self) -> Result<IpAddr> {
        resolve_host(&self.url_base).await
    }

    async fn get_external_ip_address(&self) -> Result<String> {
        let response = self.call("GetExternalIPAddress", &[]).await?;
        Ok(argument(&response, "NewExternalIPAddress"))
    }

    async fn add_port_mapping(&self, request: &AddPortMapping<'_>) -> Result<()> {
        let enabled = if request.enabled { "1" } else { "0" };
        self.call(
            "AddPortMapping",
            &[
                ("NewRemoteHost", request.remote_host.to_string()),
                ("NewExternalPort", request.external_port.to_string()),
                ("NewProtocol", request.protocol.to_string()),
                ("NewInternalPort", request.internal_port.to_string()),
                ("NewInternalClient", request.internal_client.to_string()),
                ("NewEnabled", enabled.to_string()),
                ("NewPortMappingDescription", request.description.to_string()),
                ("NewLeaseDuration", request.lease_secs.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_port_mapping(
        &self,
        remote_host: &str,
        external_port: u16,
        protocol: &str,
    ) -> Result<()> {
        self.call(
            "DeletePortMapping",
            &[
                ("NewRemoteHost", remote_host.to_string()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_nat_rsip_status(&self) -> Result<RsipStatus> {
        let response = self.call("GetNATRSIPStatus", &[]).await?;
        Ok(RsipStatus {
            rsip_available: parse_bool(&argument(&response, "NewRSIPAvailable")),
            nat_enabled: parse_bool(&argument(&response, "NewNATEnabled")),
        })
    }
}
