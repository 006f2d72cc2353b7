//! podnet-ebpf: pinned forwarding tables for the podnet overlay fast path.
//!
//! The kernel datapath looks pods up in three BPF hash maps pinned on bpffs.
//! Every CNI invocation is a fresh process, so the maps are opened by pin path
//! (and created on first use) each time.
//!
//! # Tables
//!
//! ```text
//! lxc_map    EndpointKey   (pod ip)          -> EndpointInfo     (veth ifindexes, MACs)
//! pod_map    PodNodeKey    (peer pod CIDR)   -> PodNodeValue     (peer tunnel endpoint)
//! local_map  LocalDeviceKey (device kind)    -> LocalDeviceValue (ifindex, MAC)
//! ```

pub mod error;
pub mod manager;
pub mod pinned;
pub mod record;
pub mod sys;
pub mod table;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use error::{RecordError, Result, TableError};
pub use manager::{MAX_ENTRIES, TableManager, TablePaths};
pub use pinned::BpfFs;
pub use record::{
    DeviceKind, EndpointInfo, EndpointKey, LocalDeviceKey, LocalDeviceValue, PodNodeKey,
    PodNodeValue, Record, format_mac, parse_mac,
};
pub use table::{BatchOutcome, RawTable, ReconcileReport, Table, TableBackend, TableSpec};
