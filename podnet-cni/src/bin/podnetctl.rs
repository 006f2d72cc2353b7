//! podnetctl: inspect and repair podnet node state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use podnet_cni::{IpRouteWiring, NetConf, open_ipam, open_tables, sync_remote_pods};
use podnet_ebpf::format_mac;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "podnetctl")]
#[command(about = "Inspect and repair podnet node state", long_about = None)]
struct Cli {
    /// Plugin network configuration (the same JSON the runtime passes)
    #[arg(short, long, default_value = "/etc/cni/net.d/10-podnet.conf")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pinned forwarding tables
    Tables {
        #[command(subcommand)]
        command: TablesCommand,
    },
    /// Address leases and node registrations
    Ipam {
        #[command(subcommand)]
        command: IpamCommand,
    },
    /// Reconcile remote pod table and routes with the registered nodes
    Sync,
}

#[derive(Subcommand)]
enum TablesCommand {
    /// Print all three tables
    Dump,
    /// Remove every entry from all three tables
    Flush,
}

#[derive(Subcommand)]
enum IpamCommand {
    /// List leases
    Leases {
        /// Include released leases
        #[arg(short, long)]
        all: bool,
    },
    /// List registered nodes
    Nodes,
    /// Release addresses
    Release {
        #[arg(required = true)]
        ips: Vec<Ipv4Addr>,
    },
}

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "HOST IFINDEX")]
    if_index: u32,
    #[tabled(rename = "POD IFINDEX")]
    lxc_if_index: u32,
    #[tabled(rename = "POD MAC")]
    mac: String,
    #[tabled(rename = "NODE MAC")]
    node_mac: String,
}

#[derive(Tabled)]
struct RemotePodRow {
    #[tabled(rename = "POD CIDR")]
    pod_cidr: String,
    #[tabled(rename = "TUNNEL ENDPOINT")]
    tunnel_endpoint: String,
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "IFINDEX")]
    if_index: u32,
    #[tabled(rename = "MAC")]
    mac: String,
}

#[derive(Tabled)]
struct LeaseRow {
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "CONTAINER")]
    container: String,
    #[tabled(rename = "IFNAME")]
    ifname: String,
    #[tabled(rename = "UPDATED")]
    updated: String,
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "INTERFACE")]
    interface: String,
    #[tabled(rename = "TUNNEL ENDPOINT")]
    tunnel_endpoint: String,
    #[tabled(rename = "POD CIDR")]
    pod_cidr: String,
}

fn print_rows<T: Tabled>(title: &str, rows: Vec<T>) {
    if rows.is_empty() {
        println!("{}: empty", title);
    } else {
        println!("{}:", title);
        println!("{}", Table::new(rows));
    }
}

fn short_id(id: Option<&str>) -> String {
    match id {
        Some(id) if id.len() > 12 => id[..12].to_string(),
        Some(id) => id.to_string(),
        None => "-".to_string(),
    }
}

fn load_config(path: &Path) -> Result<NetConf> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    NetConf::parse(&bytes).with_context(|| format!("Invalid configuration in {}", path.display()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let conf = load_config(&cli.config)?;

    match cli.command {
        Commands::Tables { command } => {
            let mut tables = open_tables(&conf).context("Failed to open forwarding tables")?;
            match command {
                TablesCommand::Dump => {
                    let endpoints = tables
                        .endpoints()
                        .entries()?
                        .into_iter()
                        .map(|(key, info)| EndpointRow {
                            ip: key.ip.to_string(),
                            if_index: info.if_index,
                            lxc_if_index: info.lxc_if_index,
                            mac: format_mac(&info.mac),
                            node_mac: format_mac(&info.node_mac),
                        })
                        .collect();
                    print_rows("Endpoints", endpoints);

                    let remote = tables
                        .remote_pods()
                        .entries()?
                        .into_iter()
                        .map(|(key, value)| RemotePodRow {
                            pod_cidr: key.pod_cidr.to_string(),
                            tunnel_endpoint: value.tunnel_endpoint.to_string(),
                        })
                        .collect();
                    print_rows("Remote pods", remote);

                    let devices = tables
                        .local_devices()
                        .entries()?
                        .into_iter()
                        .map(|(key, value)| DeviceRow {
                            kind: key.kind.as_str().to_string(),
                            if_index: value.if_index,
                            mac: format_mac(&value.mac),
                        })
                        .collect();
                    print_rows("Local devices", devices);
                }
                TablesCommand::Flush => {
                    let removed = tables.flush_all()?;
                    println!("Removed {} entries", removed);
                }
            }
        }

        Commands::Ipam { command } => {
            let ipam = open_ipam(&conf).await.context("Failed to open address store")?;
            match command {
                IpamCommand::Leases { all } => {
                    let rows = ipam
                        .leases()
                        .await?
                        .into_iter()
                        .filter(|l| all || l.is_reserved())
                        .map(|l| LeaseRow {
                            ip: l.ip.to_string(),
                            node: l.node.clone(),
                            state: if l.is_reserved() { "reserved" } else { "released" }
                                .to_string(),
                            container: short_id(l.container_id.as_deref()),
                            ifname: l.ifname.clone().unwrap_or_else(|| "-".to_string()),
                            updated: l.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        })
                        .collect();
                    print_rows("Leases", rows);
                }
                IpamCommand::Nodes => {
                    let rows = ipam
                        .all_host_network()
                        .await?
                        .into_iter()
                        .map(|h| NodeRow {
                            name: h.name,
                            interface: h.interface,
                            tunnel_endpoint: h.tunnel_endpoint.to_string(),
                            pod_cidr: h.pod_cidr.to_string(),
                        })
                        .collect();
                    print_rows("Nodes", rows);
                }
                IpamCommand::Release { ips } => {
                    ipam.release(&ips).await?;
                    println!("Released {} address(es)", ips.len());
                }
            }
        }

        Commands::Sync => {
            let mut tables = open_tables(&conf).context("Failed to open forwarding tables")?;
            let ipam = open_ipam(&conf).await.context("Failed to open address store")?;
            let report = sync_remote_pods(&ipam, &mut tables, &IpRouteWiring::new()).await?;
            println!(
                "{} peer(s): {} entries written, {} removed, {} stale route(s) dropped",
                report.peers,
                report.written,
                report.removed,
                report.stale_routes.len()
            );
        }
    }

    Ok(())
}
