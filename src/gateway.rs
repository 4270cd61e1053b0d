//! Default gateway resolution for different platforms

use crate::types::NatError;
use crate::Result;
use std::net::Ipv4Addr;
use tracing::debug;

/// Find the IPv4 default gateway without blocking the runtime
pub async fn default_gateway() -> Result<Ipv4Addr> {
    let gateway = tokio::task::spawn_blocking(find_default_gateway)
        .await
        .map_err(|e| NatError::Internal(format!("Task join error: {}", e)))??;
    debug!("Found default gateway: {}", gateway);
    Ok(gateway)
}

/// Find the IPv4 default gateway
///
/// On Linux this reads the routing table, on macOS it asks `netstat`, and on
/// Windows `route print`.
pub fn find_default_gateway() -> Result<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        find_gateway_linux()
    }

    #[cfg(target_os = "macos")]
    {
        find_gateway_macos()
    }

    #[cfg(target_os = "windows")]
    {
        find_gateway_windows()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(NatError::NoGateway)
    }
}

#[cfg(target_os = "linux")]
fn find_gateway_linux() -> Result<Ipv4Addr> {
    let route_table = std::fs::read_to_string("/proc/net/route")
        .map_err(|e| NatError::Internal(format!("Failed to read route table: {}", e)))?;

    parse_proc_net_route(&route_table).ok_or(NatError::NoGateway)
}

#[cfg(target_os = "macos")]
fn find_gateway_macos() -> Result<Ipv4Addr> {
    use std::process::Command;

    let output = Command::new("netstat")
        .args(["-rn", "-f", "inet"])
        .output()
        .map_err(|e| NatError::Internal(format!("Failed to run netstat: {}", e)))?;

    parse_netstat_routes(&String::from_utf8_lossy(&output.stdout)).ok_or(NatError::NoGateway)
}

#[cfg(target_os = "windows")]
fn find_gateway_windows() -> Result<Ipv4Addr> {
    use std::process::Command;

    let output = Command::new("route")
        .args(["print", "0.0.0.0"])
        .output()
        .map_err(|e| NatError::Internal(format!("Failed to run route: {}", e)))?;

    parse_route_print(&String::from_utf8_lossy(&output.stdout)).ok_or(NatError::NoGateway)
}

/// Default route from the contents of `/proc/net/route`
///
/// Addresses are printed as the in-memory `u32`, so the native byte order
/// gives back network order.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn parse_proc_net_route(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }

        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        let ip = Ipv4Addr::from(raw.to_ne_bytes());
        (!ip.is_unspecified()).then_some(ip)
    })
}

/// Default route from `netstat -rn -f inet` output
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_netstat_routes(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter(|line| line.starts_with("default"))
        .find_map(|line| line.split_whitespace().nth(1)?.parse().ok())
}

/// Default route from `route print 0.0.0.0` output
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) fn parse_route_print(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("0.0.0.0"))
        .find_map(|line| line.split_whitespace().nth(2)?.parse().ok())
}
