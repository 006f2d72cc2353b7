//! Node network records and local address discovery.

use crate::error::{IpamError, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// What every node publishes about itself: where its pods live and how the
/// overlay reaches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNetwork {
    pub name: String,
    /// Uplink interface carrying the overlay.
    pub interface: String,
    pub tunnel_endpoint: Ipv4Addr,
    pub pod_cidr: Ipv4Net,
    pub updated_at: DateTime<Utc>,
}

/// Node name from the hostname.
pub fn default_node_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// First usable IPv4 address among `(interface, address)` pairs.
///
/// With `interface` set only that interface is considered; otherwise the
/// first non-loopback interface wins.
pub fn pick_tunnel_endpoint<I>(addrs: I, interface: Option<&str>) -> Option<(String, Ipv4Addr)>
where
    I: IntoIterator<Item = (String, Ipv4Addr)>,
{
    addrs.into_iter().find(|(name, ip)| {
        let usable = !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local();
        match interface {
            Some(wanted) => usable && name == wanted,
            None => usable && name != "lo",
        }
    })
}

/// Detect this node's tunnel endpoint from the host's interface addresses.
pub fn detect_tunnel_endpoint(interface: Option<&str>) -> Result<(String, Ipv4Addr)> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| {
        IpamError::NoTunnelEndpoint(format!(
            "{} (getifaddrs: {})",
            interface.unwrap_or("any"),
            e
        ))
    })?;

    let candidates = addrs.filter_map(|ifa| {
        let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
        Some((ifa.interface_name.clone(), Ipv4Addr::from(sin.ip())))
    });

    pick_tunnel_endpoint(candidates, interface)
        .ok_or_else(|| IpamError::NoTunnelEndpoint(interface.unwrap_or("any").to_string()))
}
