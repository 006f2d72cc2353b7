//! IPAM and coordination store errors.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors from a coordination store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Put-if-absent found the key already present.
    #[error("conflict: key {0} already exists")]
    Conflict(String),

    /// Conditional write lost against another writer.
    /// `actual` is 0 when the key no longer exists.
    #[error("version mismatch on {key}: expected {expected}, got {actual}")]
    VersionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The store cannot be reached right now; the caller may retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),

    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Whether the error is a lost conditional write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_) | StoreError::VersionMismatch { .. }
        )
    }

    /// Whether retrying later could succeed.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            #[cfg(feature = "etcd")]
            StoreError::Etcd(e) => matches!(
                e,
                etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_)
            ),
            _ => false,
        }
    }
}

/// Errors from address allocation.
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("no free address in {0}")]
    AllocationExhausted(Ipv4Net),

    /// Every node slice of the cluster subnet is claimed.
    #[error("no free /{prefix_len} slice left in {subnet}")]
    NoNodeSubnet { subnet: Ipv4Net, prefix_len: u8 },

    #[error("node prefix /{prefix_len} does not fit in {subnet}")]
    InvalidNodePrefix { subnet: Ipv4Net, prefix_len: u8 },

    #[error("no IPv4 address found on interface {0}")]
    NoTunnelEndpoint(String),

    #[error("node {0} is not registered")]
    NodeNotRegistered(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("address {ip} is outside {subnet}")]
    OutOfSubnet { ip: Ipv4Addr, subnet: Ipv4Net },

    #[error("corrupt record under {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },

    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IpamError {
    /// The coordination store could not be reached.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, IpamError::Store(e) if e.is_unavailable())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type Result<T> = std::result::Result<T, IpamError>;
