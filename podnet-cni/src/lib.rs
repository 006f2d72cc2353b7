//! podnet CNI plugin.
//!
//! One process per runtime request:
//!
//! ```text
//!  stdin (NetConf) + CNI_* env
//!          |
//!          v
//!   Plugin::add / check / del
//!     |          |           |
//!     v          v           v
//!   Ipam      Wiring     TableManager
//!  (leases)  (veth/br)  (pinned maps)
//! ```
//!
//! After a successful ADD the remote-pod table and host routes are
//! reconciled with the peers registered in the coordination store.

pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod result;
pub mod topology;
pub mod wiring;

pub use config::{CmdArgs, NetConf};
pub use error::{PluginError, Result};
pub use plugin::{DelReport, Plugin, delete};
pub use result::{CniResult, ErrorReply, VersionReply};
pub use topology::{TopologyReport, register_local_devices, sync_remote_pods};
pub use wiring::{
    AttachRequest, Attachment, CommandOutput, CommandRunner, IpRouteWiring, LinkInfo,
    SystemRunner, Wiring, WiringError, host_veth_name,
};

use podnet_ebpf::{BpfFs, TableManager};
use podnet_ipam::{CoordinationStore, Ipam};
use std::sync::Arc;

/// Open the pinned forwarding tables described by `conf`.
pub fn open_tables(conf: &NetConf) -> Result<TableManager> {
    Ok(TableManager::init(&BpfFs, &conf.table_paths())?)
}

/// Connect to the coordination store and register this node.
pub async fn open_ipam(conf: &NetConf) -> Result<Ipam> {
    let store: Arc<dyn CoordinationStore> =
        Arc::from(podnet_ipam::store::open(&conf.store_config()?).await?);
    Ok(Ipam::init(conf.subnet, store, conf.ipam_options()).await?)
}
