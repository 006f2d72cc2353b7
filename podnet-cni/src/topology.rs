//! Keeps the remote-pod table, host routes and local device table in step
//! with the cluster's node records.

use crate::error::Result;
use crate::wiring::{Wiring, WiringError};
use ipnet::Ipv4Net;
use podnet_ebpf::{DeviceKind, LocalDeviceValue, TableManager};
use podnet_ipam::{HostNetwork, Ipam};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// What a topology sync changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopologyReport {
    pub peers: usize,
    pub written: usize,
    pub removed: usize,
    pub stale_routes: Vec<Ipv4Net>,
}

/// Remote pod CIDRs reachable through a peer's tunnel endpoint.
///
/// Peers sharing this node's CIDR (shared mode) get no entry: their pods are
/// not distinguishable by prefix.
pub fn remote_routes(local_cidr: Ipv4Net, peers: &[HostNetwork]) -> Vec<(Ipv4Net, Ipv4Addr)> {
    let mut routes: Vec<_> = peers
        .iter()
        .filter(|p| !p.pod_cidr.contains(&local_cidr) && !local_cidr.contains(&p.pod_cidr))
        .map(|p| (p.pod_cidr, p.tunnel_endpoint))
        .collect();
    routes.sort();
    routes.dedup_by_key(|(cidr, _)| *cidr);
    routes
}

/// Reconcile the remote-pod table and host routes against the registered
/// peers. Routes for CIDRs that left the table are removed.
pub async fn sync_remote_pods<W: Wiring + ?Sized>(
    ipam: &Ipam,
    tables: &mut TableManager,
    wiring: &W,
) -> Result<TopologyReport> {
    let peers = ipam.peers().await?;
    let desired = remote_routes(ipam.pod_cidr(), &peers);

    let previous: Vec<Ipv4Net> = tables
        .remote_pods()
        .keys()?
        .into_iter()
        .map(|k| k.pod_cidr)
        .collect();

    let report = tables.sync_remote_pods(&desired)?;

    let stale_routes: Vec<Ipv4Net> = previous
        .into_iter()
        .filter(|cidr| !desired.iter().any(|(d, _)| d == cidr))
        .collect();

    wiring.install_remote_routes(&desired).await?;
    wiring.remove_remote_routes(&stale_routes).await?;

    info!(
        peers = peers.len(),
        written = report.written,
        removed = report.removed,
        "Remote pod table synced"
    );

    Ok(TopologyReport {
        peers: peers.len(),
        written: report.written,
        removed: report.removed,
        stale_routes,
    })
}

/// Record bridge, uplink and (if configured) overlay device in the local
/// device table.
pub async fn register_local_devices<W: Wiring + ?Sized>(
    tables: &mut TableManager,
    wiring: &W,
    bridge: &str,
    uplink: &str,
    vxlan: Option<&str>,
) -> Result<()> {
    let mut devices = vec![(DeviceKind::Bridge, bridge)];
    if uplink.is_empty() {
        debug!("No uplink interface configured");
    } else {
        devices.push((DeviceKind::Uplink, uplink));
    }
    if let Some(vxlan) = vxlan {
        devices.push((DeviceKind::Vxlan, vxlan));
    }

    for (kind, name) in devices {
        let link = match wiring.link_info(name).await {
            Ok(link) => link,
            Err(WiringError::LinkNotFound(_)) if kind == DeviceKind::Vxlan => {
                debug!(device = name, "Overlay device not present yet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let value = LocalDeviceValue {
            if_index: link.if_index,
            mac: link.mac,
        };
        if tables.local_device(kind)? != Some(value) {
            tables.set_local_device(kind, &value)?;
        }
    }
    Ok(())
}
