//! podnet-ipam: cluster-wide pod address management.
//!
//! Each node claims a slice of the cluster subnet and hands out addresses
//! from it. State lives in a shared [`CoordinationStore`] (etcd in a real
//! cluster, SQLite for a single host) and is only ever changed with
//! conditional writes, so concurrent plugin processes on any node never hand
//! out the same address twice.

pub mod allocator;
pub mod error;
pub mod host;
pub mod store;

// Re-export commonly used types
pub use allocator::{
    DEFAULT_KEY_PREFIX, DEFAULT_NODE_PREFIX_LEN, Ipam, IpamOptions, Lease, LeaseOwner, LeaseState,
    MAX_ALLOCATION_ROUNDS,
};
pub use error::{IpamError, Result, StoreError, StoreResult};
pub use host::HostNetwork;
pub use store::{CoordinationStore, KeyValue, SqliteStore, StoreConfig};

#[cfg(feature = "etcd")]
pub use store::EtcdStore;

#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryStore;
