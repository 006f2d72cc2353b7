//! Host and container interface wiring.
//!
//! [`IpRouteWiring`] drives `ip`, `nsenter`, `sysctl` and `iptables` through a
//! [`CommandRunner`], so the exact command sequence can be checked in tests.
//! Link deletion goes through rtnetlink.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use podnet_ebpf::{format_mac, parse_mac};
use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("cannot parse link info for {name}: {output}")]
    Parse { name: String, output: String },

    #[error("invalid interface name '{0}'")]
    InvalidName(String),

    #[error("netlink error on {name}: {source}")]
    Netlink { name: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, WiringError>;

/// Output of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs programs on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Index and MAC of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub if_index: u32,
    pub mac: [u8; 6],
}

impl LinkInfo {
    pub fn mac_string(&self) -> String {
        format_mac(&self.mac)
    }
}

/// Everything needed to connect one pod interface to the node bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub bridge: String,
    /// Gateway address with the cluster mask, assigned to the bridge.
    pub gateway: Ipv4Net,
    /// Pod address with its prefix.
    pub pod_address: Ipv4Net,
    pub mtu: u32,
    pub netns: String,
    /// Interface name inside the pod.
    pub ifname: String,
    /// Host end of the veth pair.
    pub host_veth: String,
}

/// Result of a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub host: LinkInfo,
    pub pod: LinkInfo,
}

#[async_trait]
pub trait Wiring: Send + Sync {
    /// Create bridge (if missing) and veth pair, move the peer into the pod
    /// and configure its address and default route.
    async fn attach(&self, req: &AttachRequest) -> Result<Attachment>;

    /// Remove the host veth (the peer goes with it). A missing link is fine.
    async fn detach(&self, host_veth: &str) -> Result<()>;

    /// Index and MAC of a host link.
    async fn link_info(&self, name: &str) -> Result<LinkInfo>;

    /// Index and MAC of a link inside a network namespace.
    async fn pod_link_info(&self, netns: &str, ifname: &str) -> Result<LinkInfo>;

    /// Route each peer pod CIDR via the peer's tunnel endpoint.
    async fn install_remote_routes(&self, routes: &[(Ipv4Net, Ipv4Addr)]) -> Result<()>;

    async fn remove_remote_routes(&self, cidrs: &[Ipv4Net]) -> Result<()>;
}

/// 32-bit FNV-1a, stable across builds so ADD and DEL derive the same names.
fn fnv1a(parts: &[&str]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for part in parts {
        for b in part.bytes().chain(std::iter::once(0)) {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    hash
}

/// Host-side veth name for a container interface.
pub fn host_veth_name(container_id: &str, ifname: &str) -> String {
    format!("pn{:08x}", fnv1a(&[container_id, ifname]))
}

/// Temporary name of the pod end before it is renamed inside the netns.
fn peer_temp_name(host_veth: &str) -> String {
    format!("pt{}", &host_veth[2..])
}

/// Parse `ip -o link show` output into index and MAC.
pub fn parse_link_line(name: &str, output: &str) -> Result<LinkInfo> {
    let parse_err = || WiringError::Parse {
        name: name.to_string(),
        output: output.trim().to_string(),
    };

    let line = output.lines().next().ok_or_else(parse_err)?;
    let if_index = line
        .split(':')
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(parse_err)?;

    let mut tokens = line.split_whitespace();
    let mac = tokens
        .find(|t| *t == "link/ether")
        .and_then(|_| tokens.next())
        .and_then(parse_mac)
        .ok_or_else(parse_err)?;

    Ok(LinkInfo { if_index, mac })
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Wiring with iproute2 and iptables.
pub struct IpRouteWiring<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl IpRouteWiring<SystemRunner> {
    pub fn new() -> Self {
        Self {
            runner: SystemRunner,
        }
    }
}

impl Default for IpRouteWiring<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> IpRouteWiring<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run a command. Failures whose stderr contains one of `tolerate` count
    /// as success.
    fn exec(&self, program: &str, argv: Vec<String>, tolerate: &[&str]) -> Result<String> {
        let output = self
            .runner
            .run(program, &argv)
            .map_err(|source| WiringError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if output.success {
            return Ok(output.stdout);
        }
        if tolerate.iter().any(|t| output.stderr.contains(t)) {
            debug!(
                program,
                args = ?argv,
                stderr = %output.stderr.trim(),
                "Ignoring expected failure"
            );
            return Ok(output.stdout);
        }
        Err(WiringError::Command {
            command: format!("{} {}", program, argv.join(" ")),
            stderr: output.stderr.trim().to_string(),
        })
    }

    fn ip(&self, list: &[&str], tolerate: &[&str]) -> Result<String> {
        self.exec("ip", args(list), tolerate)
    }

    fn ip_netns(&self, netns: &str, list: &[&str]) -> Result<String> {
        let mut argv = vec![format!("--net={}", netns), "ip".to_string()];
        argv.extend(args(list));
        self.exec("nsenter", argv, &[])
    }

    fn ensure_bridge(&self, bridge: &str, gateway: &Ipv4Net, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        let gateway = gateway.to_string();
        self.ip(&["link", "add", "name", bridge, "type", "bridge"], &["File exists"])?;
        self.ip(&["addr", "add", &gateway, "dev", bridge], &["File exists"])?;
        self.ip(&["link", "set", "dev", bridge, "mtu", &mtu, "up"], &[])?;
        Ok(())
    }

    fn ensure_forwarding(&self, bridge: &str) -> Result<()> {
        self.exec("sysctl", args(&["-w", "net.ipv4.ip_forward=1"]), &[])?;
        for dir in ["-i", "-o"] {
            let rule = ["FORWARD", dir, bridge, "-j", "ACCEPT"];
            let mut check = args(&["-C"]);
            check.extend(args(&rule));
            if self.exec("iptables", check, &[]).is_ok() {
                continue;
            }
            let mut append = args(&["-A"]);
            append.extend(args(&rule));
            self.exec("iptables", append, &[])?;
        }
        Ok(())
    }

    fn create_pair(&self, req: &AttachRequest) -> Result<()> {
        let mtu = req.mtu.to_string();
        let peer = peer_temp_name(&req.host_veth);
        let pod_address = req.pod_address.to_string();
        let gateway = req.gateway.addr().to_string();

        self.ip(
            &[
                "link", "add", "name", &req.host_veth, "mtu", &mtu, "type", "veth", "peer", "name",
                &peer, "mtu", &mtu,
            ],
            &[],
        )?;
        self.ip(
            &["link", "set", "dev", &req.host_veth, "master", &req.bridge, "up"],
            &[],
        )?;
        self.ip(&["link", "set", "dev", &peer, "netns", &req.netns], &[])?;

        self.ip_netns(&req.netns, &["link", "set", "dev", &peer, "name", &req.ifname])?;
        self.ip_netns(&req.netns, &["addr", "add", &pod_address, "dev", &req.ifname])?;
        self.ip_netns(&req.netns, &["link", "set", "dev", &req.ifname, "up"])?;
        self.ip_netns(&req.netns, &["link", "set", "dev", "lo", "up"])?;
        self.ip_netns(
            &req.netns,
            &[
                "route", "replace", "default", "via", &gateway, "dev", &req.ifname, "onlink",
            ],
        )?;
        Ok(())
    }

    fn read_link(&self, name: &str) -> Result<LinkInfo> {
        let output = self
            .ip(&["-o", "link", "show", "dev", name], &[])
            .map_err(|e| match e {
                WiringError::Command { stderr, .. } if stderr.contains("does not exist") => {
                    WiringError::LinkNotFound(name.to_string())
                }
                other => other,
            })?;
        parse_link_line(name, &output)
    }
}

#[async_trait]
impl<R: CommandRunner> Wiring for IpRouteWiring<R> {
    async fn attach(&self, req: &AttachRequest) -> Result<Attachment> {
        for name in [&req.bridge, &req.ifname, &req.host_veth] {
            if !crate::config::is_valid_ifname(name) {
                return Err(WiringError::InvalidName(name.clone()));
            }
        }

        self.ensure_bridge(&req.bridge, &req.gateway, req.mtu)?;
        // Leftover from an interrupted ADD
        self.ip(&["link", "del", &req.host_veth], &["Cannot find device"])?;

        let wired = self.create_pair(req).and_then(|()| {
            self.ensure_forwarding(&req.bridge)?;
            let host = self.read_link(&req.host_veth)?;
            let output =
                self.ip_netns(&req.netns, &["-o", "link", "show", "dev", &req.ifname])?;
            let pod = parse_link_line(&req.ifname, &output)?;
            Ok(Attachment { host, pod })
        });

        match wired {
            Ok(attachment) => {
                info!(
                    host_veth = %req.host_veth,
                    pod_address = %req.pod_address,
                    netns = %req.netns,
                    "Attached pod interface"
                );
                Ok(attachment)
            }
            Err(e) => {
                let cleanup = self.ip(&["link", "del", &req.host_veth], &["Cannot find device"]);
                if let Err(cleanup) = cleanup {
                    warn!(
                        host_veth = %req.host_veth,
                        error = %cleanup,
                        "Failed to remove half-wired veth"
                    );
                }
                Err(e)
            }
        }
    }

    async fn detach(&self, host_veth: &str) -> Result<()> {
        use rtnetlink::new_connection;

        let c_name =
            CString::new(host_veth).map_err(|_| WiringError::InvalidName(host_veth.to_string()))?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            debug!(host_veth, "Veth already gone");
            return Ok(());
        }

        let (connection, handle, _) = new_connection().map_err(|source| WiringError::Netlink {
            name: host_veth.to_string(),
            source,
        })?;
        tokio::spawn(connection);

        handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| WiringError::Netlink {
                name: host_veth.to_string(),
                source: io::Error::other(e.to_string()),
            })?;

        info!(host_veth, "Removed pod veth");
        Ok(())
    }

    async fn link_info(&self, name: &str) -> Result<LinkInfo> {
        self.read_link(name)
    }

    async fn pod_link_info(&self, netns: &str, ifname: &str) -> Result<LinkInfo> {
        let output = self
            .ip_netns(netns, &["-o", "link", "show", "dev", ifname])
            .map_err(|e| match e {
                WiringError::Command { stderr, .. } if stderr.contains("does not exist") => {
                    WiringError::LinkNotFound(ifname.to_string())
                }
                other => other,
            })?;
        parse_link_line(ifname, &output)
    }

    async fn install_remote_routes(&self, routes: &[(Ipv4Net, Ipv4Addr)]) -> Result<()> {
        for (cidr, endpoint) in routes {
            let cidr = cidr.to_string();
            let endpoint = endpoint.to_string();
            self.ip(&["route", "replace", &cidr, "via", &endpoint], &[])?;
        }
        debug!(count = routes.len(), "Installed remote pod routes");
        Ok(())
    }

    async fn remove_remote_routes(&self, cidrs: &[Ipv4Net]) -> Result<()> {
        for cidr in cidrs {
            let cidr = cidr.to_string();
            self.ip(&["route", "del", &cidr], &["No such process"])?;
        }
        Ok(())
    }
}
