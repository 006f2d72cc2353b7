//! ADD, CHECK and DEL.
//!
//! ADD reserves an address, wires the pod, then records the endpoint. Each
//! step undoes the earlier ones when it fails, so a failed ADD leaves neither
//! a lease nor a table entry behind. DEL never fails; what it could not clean
//! up is collected in a [`DelReport`].

use crate::config::{CmdArgs, NetConf};
use crate::error::{PluginError, Result};
use crate::result::{CniResult, Interface, IpConfig, Route};
use crate::topology;
use crate::wiring::{AttachRequest, Wiring, WiringError, host_veth_name};
use ipnet::Ipv4Net;
use podnet_ebpf::{EndpointInfo, TableManager, format_mac};
use podnet_ipam::{Ipam, LeaseOwner};
use std::fmt::Display;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Cleanup steps of a DEL that did not succeed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DelReport {
    pub released: Vec<Ipv4Addr>,
    pub failures: Vec<String>,
}

impl DelReport {
    pub fn record(&mut self, step: &str, err: impl Display) {
        warn!(step, error = %err, "DEL cleanup step failed");
        self.failures.push(format!("{}: {}", step, err));
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything one invocation needs, built once in `main`.
pub struct Plugin<W> {
    conf: NetConf,
    ipam: Ipam,
    tables: TableManager,
    wiring: W,
}

impl<W: Wiring> Plugin<W> {
    pub fn new(conf: NetConf, ipam: Ipam, tables: TableManager, wiring: W) -> Self {
        Self {
            conf,
            ipam,
            tables,
            wiring,
        }
    }

    pub fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    pub fn tables(&self) -> &TableManager {
        &self.tables
    }

    pub fn wiring(&self) -> &W {
        &self.wiring
    }

    fn gateway(&self) -> Result<Ipv4Net> {
        Ipv4Net::new(self.ipam.gateway(), self.ipam.subnet().prefix_len())
            .map_err(|e| PluginError::Internal(format!("gateway prefix: {}", e)))
    }

    fn uplink(&self) -> &str {
        &self.ipam.host_network().interface
    }

    pub async fn add(&mut self, args: &CmdArgs) -> Result<CniResult> {
        args.require_full()?;

        // A repeated ADD for the same interface keeps its address
        let ip = match self
            .ipam
            .owned_lease(&args.container_id, &args.ifname)
            .await?
        {
            Some(lease) => {
                debug!(ip = %lease.ip, container_id = %args.container_id, "Reusing existing lease");
                lease.ip
            }
            None => {
                let owner = LeaseOwner::new(&args.container_id, &args.ifname);
                self.ipam.reserve(Some(&owner)).await?
            }
        };

        match self.wire(args, ip).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    %ip,
                    container_id = %args.container_id,
                    error = %e,
                    "ADD failed, releasing address"
                );
                if let Err(release) = self.ipam.release(&[ip]).await {
                    warn!(%ip, error = %release, "Failed to release address after failed ADD");
                }
                Err(e)
            }
        }
    }

    async fn wire(&mut self, args: &CmdArgs, ip: Ipv4Addr) -> Result<CniResult> {
        let gateway = self.gateway()?;
        let pod_address = Ipv4Net::new(ip, self.ipam.pod_cidr().prefix_len())
            .map_err(|e| PluginError::Internal(format!("pod prefix: {}", e)))?;
        let host_veth = host_veth_name(&args.container_id, &args.ifname);

        let request = AttachRequest {
            bridge: self.conf.bridge.clone(),
            gateway,
            pod_address,
            mtu: self.conf.mtu,
            netns: args.netns.clone(),
            ifname: args.ifname.clone(),
            host_veth: host_veth.clone(),
        };
        let attachment = self.wiring.attach(&request).await?;

        let info = EndpointInfo {
            if_index: attachment.host.if_index,
            lxc_if_index: attachment.pod.if_index,
            mac: attachment.pod.mac,
            node_mac: attachment.host.mac,
        };
        if let Err(e) = self.tables.set_endpoint(ip, &info) {
            if let Err(detach) = self.wiring.detach(&host_veth).await {
                warn!(%host_veth, error = %detach, "Failed to detach after endpoint write failure");
            }
            return Err(e.into());
        }

        self.refresh_topology().await;

        info!(
            %ip,
            container_id = %args.container_id,
            ifname = %args.ifname,
            %host_veth,
            "Pod network added"
        );

        Ok(CniResult {
            cni_version: self.conf.cni_version.clone(),
            interfaces: vec![
                Interface {
                    name: host_veth,
                    mac: format_mac(&attachment.host.mac),
                    sandbox: None,
                },
                Interface {
                    name: args.ifname.clone(),
                    mac: format_mac(&attachment.pod.mac),
                    sandbox: Some(args.netns.clone()),
                },
            ],
            ips: vec![IpConfig {
                address: pod_address,
                gateway: gateway.addr(),
                interface: 1,
            }],
            routes: vec![Route {
                dst: Ipv4Net::default(),
                gw: gateway.addr(),
            }],
        })
    }

    /// Local device registration and remote pod sync. Failures here do not
    /// fail the pod: the next invocation or `podnetctl sync` catches up.
    async fn refresh_topology(&mut self) {
        let bridge = self.conf.bridge.clone();
        let uplink = self.uplink().to_string();
        let vxlan = self.conf.node.vxlan_device.clone();

        if let Err(e) = topology::register_local_devices(
            &mut self.tables,
            &self.wiring,
            &bridge,
            &uplink,
            vxlan.as_deref(),
        )
        .await
        {
            warn!(error = %e, "Failed to register local devices");
        }

        if let Err(e) = topology::sync_remote_pods(&self.ipam, &mut self.tables, &self.wiring).await
        {
            warn!(error = %e, "Failed to sync remote pods");
        }
    }

    /// Verify the lease, the endpoint entry and both veth ends agree.
    pub async fn check(&self, args: &CmdArgs) -> Result<()> {
        args.require_full()?;

        let lease = self
            .ipam
            .owned_lease(&args.container_id, &args.ifname)
            .await?
            .ok_or_else(|| {
                PluginError::Check(format!(
                    "no address reserved for {}/{}",
                    args.container_id, args.ifname
                ))
            })?;
        let ip = lease.ip;

        if let Some(prev) = &self.conf.prev_result {
            let listed = prev_result_addresses(prev);
            if !listed.is_empty() && !listed.contains(&ip) {
                return Err(PluginError::Check(format!(
                    "prevResult does not list reserved address {}",
                    ip
                )));
            }
        }

        let entry = self
            .tables
            .endpoint(ip)?
            .ok_or_else(|| PluginError::Check(format!("no endpoint entry for {}", ip)))?;

        let host_veth = host_veth_name(&args.container_id, &args.ifname);
        let host = self.wiring.link_info(&host_veth).await.map_err(missing_link)?;
        let pod = self
            .wiring
            .pod_link_info(&args.netns, &args.ifname)
            .await
            .map_err(missing_link)?;

        let expected = EndpointInfo {
            if_index: host.if_index,
            lxc_if_index: pod.if_index,
            mac: pod.mac,
            node_mac: host.mac,
        };
        if entry != expected {
            return Err(PluginError::Check(format!(
                "endpoint entry for {} is stale: table has {}, links are {}",
                ip, entry, expected
            )));
        }

        debug!(%ip, container_id = %args.container_id, "CHECK passed");
        Ok(())
    }

    /// Release the owner's leases, drop their endpoint entries and remove the
    /// veth. Never fails.
    pub async fn del(&mut self, args: &CmdArgs) -> DelReport {
        delete(Some(&self.ipam), Some(&mut self.tables), &self.wiring, args).await
    }
}

/// DEL with whatever could be opened. Without `ipam` no lease is released;
/// without `tables` only the veth is removed.
pub async fn delete<W: Wiring + ?Sized>(
    ipam: Option<&Ipam>,
    tables: Option<&mut TableManager>,
    wiring: &W,
    args: &CmdArgs,
) -> DelReport {
    let mut report = DelReport::default();
    if let Err(e) = args.require_owner() {
        report.record("arguments", e);
        return report;
    }

    match ipam {
        Some(ipam) => match ipam.release_owner(&args.container_id, &args.ifname).await {
            Ok(released) => report.released = released,
            Err(e) => report.record("release", e),
        },
        None => report.record("release", "address store not available"),
    }

    let released = report.released.clone();
    cleanup_local(tables, wiring, args, &released, &mut report).await;

    info!(
        container_id = %args.container_id,
        ifname = %args.ifname,
        released = ?report.released,
        failures = report.failures.len(),
        "Pod network deleted"
    );
    report
}

fn missing_link(e: WiringError) -> PluginError {
    match e {
        WiringError::LinkNotFound(name) => PluginError::Check(format!("link {} is missing", name)),
        other => other.into(),
    }
}

/// Addresses listed in a chained plugin's `prevResult`.
fn prev_result_addresses(prev: &serde_json::Value) -> Vec<Ipv4Addr> {
    prev.get("ips")
        .and_then(|ips| ips.as_array())
        .map(|ips| {
            ips.iter()
                .filter_map(|ip| ip.get("address")?.as_str()?.parse::<Ipv4Net>().ok())
                .map(|net| net.addr())
                .collect()
        })
        .unwrap_or_default()
}

/// Node-local part of DEL: endpoint entries and the host veth.
///
/// Entries are found by address and by the veth's ifindex, so a DEL whose
/// release failed still clears the table.
async fn cleanup_local<W: Wiring + ?Sized>(
    tables: Option<&mut TableManager>,
    wiring: &W,
    args: &CmdArgs,
    ips: &[Ipv4Addr],
    report: &mut DelReport,
) {
    let host_veth = host_veth_name(&args.container_id, &args.ifname);

    let host_index = match wiring.link_info(&host_veth).await {
        Ok(link) => Some(link.if_index),
        Err(WiringError::LinkNotFound(_)) => None,
        Err(e) => {
            report.record("link lookup", e);
            None
        }
    };

    if let Some(tables) = tables {
        let mut stale: Vec<Ipv4Addr> = ips.to_vec();
        if let Some(index) = host_index {
            match tables.endpoints().entries() {
                Ok(entries) => stale.extend(
                    entries
                        .into_iter()
                        .filter(|(_, info)| info.if_index == index)
                        .map(|(key, _)| key.ip),
                ),
                Err(e) => report.record("endpoint scan", e),
            }
        }
        stale.sort();
        stale.dedup();

        for ip in stale {
            if let Err(e) = tables.remove_endpoint(ip) {
                report.record("endpoint removal", e);
            }
        }
    }

    if let Err(e) = wiring.detach(&host_veth).await {
        report.record("detach", e);
    }
}
