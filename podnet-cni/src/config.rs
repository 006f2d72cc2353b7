//! Network configuration (JSON on stdin) and per-invocation arguments.

use crate::error::PluginError;
use ipnet::Ipv4Net;
use podnet_ebpf::{MAX_ENTRIES, TablePaths};
use podnet_ipam::{DEFAULT_KEY_PREFIX, DEFAULT_NODE_PREFIX_LEN, IpamOptions, StoreConfig};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const DEFAULT_BRIDGE: &str = "podnet0";
pub const DEFAULT_MTU: u32 = 1450;
pub const DEFAULT_STORE: &str = "etcd://127.0.0.1:2379";
pub const DEFAULT_LOG_FILE: &str = "/var/log/podnet/podnet.log";

/// Linux IFNAMSIZ minus the trailing NUL.
const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    /// `etcd://host:port[,host:port]` or `sqlite:///path`.
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-node slice length; 0 shares the whole subnet between nodes.
    #[serde(default = "default_node_prefix_len")]
    pub node_prefix_length: u8,
}

impl Default for IpamConf {
    fn default() -> Self {
        Self {
            store: default_store(),
            key_prefix: default_key_prefix(),
            node_prefix_length: default_node_prefix_len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConf {
    pub name: Option<String>,
    /// Uplink carrying the overlay.
    pub interface: Option<String>,
    pub tunnel_endpoint: Option<Ipv4Addr>,
    /// Overlay device registered in the local device table, if any.
    pub vxlan_device: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablesConf {
    pub endpoints: Option<PathBuf>,
    pub remote_pods: Option<PathBuf>,
    pub local_devices: Option<PathBuf>,
    pub capacity: Option<u32>,
}

/// Plugin network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    pub subnet: Ipv4Net,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub ipam: IpamConf,
    #[serde(default)]
    pub node: NodeConf,
    #[serde(default)]
    pub tables: TablesConf,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Result of the previous plugin in the chain, passed on CHECK/DEL.
    #[serde(default)]
    pub prev_result: Option<serde_json::Value>,
}

fn default_store() -> String {
    DEFAULT_STORE.to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_node_prefix_len() -> u8 {
    DEFAULT_NODE_PREFIX_LEN
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

/// Interface names the kernel will accept.
pub fn is_valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace())
}

impl NetConf {
    /// Parse and validate the configuration read from stdin.
    pub fn parse(bytes: &[u8]) -> Result<Self, PluginError> {
        let conf: NetConf = serde_json::from_slice(bytes).map_err(PluginError::Decode)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        let invalid = |msg: String| Err(PluginError::Config(msg));

        if self.name.is_empty() {
            return invalid("network name is empty".to_string());
        }
        if !is_valid_ifname(&self.bridge) {
            return invalid(format!("invalid bridge name '{}'", self.bridge));
        }
        if self.subnet.prefix_len() > 30 {
            return invalid(format!("subnet {} is too small", self.subnet));
        }
        if self.subnet.network() != self.subnet.addr() {
            return invalid(format!(
                "subnet {} has host bits set (did you mean {}?)",
                self.subnet,
                self.subnet.trunc()
            ));
        }
        if !(576..=9000).contains(&self.mtu) {
            return invalid(format!("mtu {} out of range", self.mtu));
        }
        let len = self.ipam.node_prefix_length;
        if len != 0 && (len < self.subnet.prefix_len() || len > 30) {
            return invalid(format!(
                "nodePrefixLength /{} does not fit subnet {}",
                len, self.subnet
            ));
        }
        if StoreConfig::parse(&self.ipam.store).is_none() {
            return invalid(format!("unsupported ipam store '{}'", self.ipam.store));
        }
        if let Some(iface) = &self.node.interface {
            if !is_valid_ifname(iface) {
                return invalid(format!("invalid node interface '{}'", iface));
            }
        }
        if self.tables.capacity == Some(0) {
            return invalid("table capacity must be positive".to_string());
        }
        Ok(())
    }

    pub fn store_config(&self) -> Result<StoreConfig, PluginError> {
        StoreConfig::parse(&self.ipam.store).ok_or_else(|| {
            PluginError::Config(format!("unsupported ipam store '{}'", self.ipam.store))
        })
    }

    pub fn ipam_options(&self) -> IpamOptions {
        IpamOptions {
            node_name: self.node.name.clone(),
            interface: self.node.interface.clone(),
            tunnel_endpoint: self.node.tunnel_endpoint,
            key_prefix: self.ipam.key_prefix.clone(),
            node_prefix_len: match self.ipam.node_prefix_length {
                0 => None,
                len => Some(len),
            },
        }
    }

    pub fn table_paths(&self) -> TablePaths {
        let defaults = TablePaths::default();
        TablePaths {
            endpoints: self.tables.endpoints.clone().unwrap_or(defaults.endpoints),
            remote_pods: self.tables.remote_pods.clone().unwrap_or(defaults.remote_pods),
            local_devices: self
                .tables
                .local_devices
                .clone()
                .unwrap_or(defaults.local_devices),
            capacity: self.tables.capacity.unwrap_or(MAX_ENTRIES),
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
    }
}

/// The per-invocation CNI arguments (`CNI_*` environment).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
}

impl CmdArgs {
    /// ADD and CHECK need all of container id, netns and ifname.
    pub fn require_full(&self) -> Result<(), PluginError> {
        if self.container_id.is_empty() {
            return Err(PluginError::Args("CNI_CONTAINERID is required".to_string()));
        }
        if self.netns.is_empty() {
            return Err(PluginError::Args("CNI_NETNS is required".to_string()));
        }
        self.require_ifname()
    }

    /// DEL may run without a netns, but still needs to know what to release.
    pub fn require_owner(&self) -> Result<(), PluginError> {
        if self.container_id.is_empty() {
            return Err(PluginError::Args("CNI_CONTAINERID is required".to_string()));
        }
        self.require_ifname()
    }

    fn require_ifname(&self) -> Result<(), PluginError> {
        if !is_valid_ifname(&self.ifname) {
            return Err(PluginError::Args(format!(
                "invalid CNI_IFNAME '{}'",
                self.ifname
            )));
        }
        Ok(())
    }
}
