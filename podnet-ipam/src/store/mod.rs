//! Coordination store abstraction.
//!
//! The allocator needs a small, shared, linearizable key/value store with
//! conditional writes. Every value carries the store revision of its last
//! write; revisions only grow, so a version observed once can never match a
//! later, unrelated write to the same key.

#[cfg(feature = "etcd")]
mod etcd;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod sqlite;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreResult;
use async_trait::async_trait;

/// A key with its value and the revision that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// Shared key/value store with atomic conditional writes.
///
/// Conditional operations fail with `StoreError::Conflict` (put-if-absent
/// found a key) or `StoreError::VersionMismatch` (someone else wrote first).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// All keys starting with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Write `value` only if `key` does not exist. Returns the new version.
    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64>;

    /// Write `value` only if `key` is still at `version`. Returns the new
    /// version.
    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64>;

    /// Delete `key` only if it is still at `version`.
    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64>;
}

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// etcd cluster endpoints, e.g. `http://127.0.0.1:2379`.
    Etcd { endpoints: Vec<String> },
    /// SQLite database file, shared by every plugin process on the host.
    Sqlite { path: std::path::PathBuf },
}

impl StoreConfig {
    /// Parse `etcd://host:port[,host:port]` or `sqlite:///path/to/db`.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix("etcd://") {
            let endpoints: Vec<String> = rest
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(|e| format!("http://{}", e))
                .collect();
            if endpoints.is_empty() {
                return None;
            }
            return Some(StoreConfig::Etcd { endpoints });
        }
        if let Some(path) = s.strip_prefix("sqlite://") {
            if path.is_empty() {
                return None;
            }
            return Some(StoreConfig::Sqlite { path: path.into() });
        }
        None
    }
}

/// Open the configured backend.
pub async fn open(config: &StoreConfig) -> StoreResult<Box<dyn CoordinationStore>> {
    match config {
        #[cfg(feature = "etcd")]
        StoreConfig::Etcd { endpoints } => Ok(Box::new(EtcdStore::connect(endpoints).await?)),
        #[cfg(not(feature = "etcd"))]
        StoreConfig::Etcd { .. } => Err(crate::error::StoreError::Unavailable(
            "built without etcd support".to_string(),
        )),
        StoreConfig::Sqlite { path } => Ok(Box::new(SqliteStore::new(path)?)),
    }
}
