//! In-process coordination store for tests.

use super::{CoordinationStore, KeyValue};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    revision: u64,
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    unavailable: bool,
}

/// Mutex-protected map with etcd-style revisions. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        f(&mut state)
    }
}

impl State {
    fn write(&mut self, key: &str, value: &[u8]) -> u64 {
        self.revision += 1;
        self.entries
            .insert(key.to_string(), (value.to_vec(), self.revision));
        self.revision
    }

    fn check(&self, key: &str, expected: u64) -> StoreResult<()> {
        let actual = self.entries.get(key).map(|(_, v)| *v).unwrap_or(0);
        if actual != expected {
            return Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.with(|s| {
            Ok(s.entries.get(key).map(|(value, version)| KeyValue {
                key: key.to_string(),
                value: value.clone(),
                version: *version,
            }))
        })
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.with(|s| {
            Ok(s.entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, (value, version))| KeyValue {
                    key: k.clone(),
                    value: value.clone(),
                    version: *version,
                })
                .collect())
        })
    }

    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.with(|s| {
            if s.entries.contains_key(key) {
                return Err(StoreError::Conflict(key.to_string()));
            }
            Ok(s.write(key, value))
        })
    }

    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64> {
        self.with(|s| {
            s.check(key, version)?;
            Ok(s.write(key, value))
        })
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()> {
        self.with(|s| {
            s.check(key, version)?;
            s.revision += 1;
            s.entries.remove(key);
            Ok(())
        })
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.with(|s| Ok(s.write(key, value)))
    }
}
