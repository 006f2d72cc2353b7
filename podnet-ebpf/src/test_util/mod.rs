//! Test utilities for podnet-ebpf and the crates built on it.
//!
//! [`MemoryBackend`] stands in for bpffs: tables live in a process-wide
//! registry keyed by pin path, so opening the same path twice yields the same
//! table, exactly like reopening a kernel pin.

use crate::error::{Result, TableError};
use crate::table::{RawTable, TableBackend, TableSpec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type SnapshotHook = Box<dyn FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>) + Send>;

struct MemoryMap {
    key_size: usize,
    value_size: usize,
    capacity: u32,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    after_snapshot: Option<SnapshotHook>,
}

#[derive(Default)]
struct Registry {
    maps: HashMap<PathBuf, Arc<Mutex<MemoryMap>>>,
    dirs: HashSet<PathBuf>,
    failing_dirs: HashSet<PathBuf>,
    creates: usize,
}

/// In-memory table backend. Clones share the same registry.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ensure_pin_dir` fail for `dir` with a permission error.
    pub fn fail_dir(&self, dir: impl Into<PathBuf>) {
        self.registry.lock().unwrap().failing_dirs.insert(dir.into());
    }

    /// Directories created so far.
    pub fn dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = self.registry.lock().unwrap().dirs.iter().cloned().collect();
        dirs.sort();
        dirs
    }

    pub fn is_pinned(&self, path: impl AsRef<Path>) -> bool {
        self.registry
            .lock()
            .unwrap()
            .maps
            .contains_key(path.as_ref())
    }

    /// Number of tables actually created (not reopened).
    pub fn creates(&self) -> usize {
        self.registry.lock().unwrap().creates
    }

    /// Pin a table with arbitrary sizes, as a foreign program would.
    pub fn pin_foreign(&self, spec: &TableSpec) {
        let mut registry = self.registry.lock().unwrap();
        registry.maps.insert(
            spec.path.clone(),
            Arc::new(Mutex::new(MemoryMap {
                key_size: spec.key_size,
                value_size: spec.value_size,
                capacity: spec.capacity,
                entries: BTreeMap::new(),
                after_snapshot: None,
            })),
        );
    }

    /// Run `hook` once, right after the next key snapshot of the table at
    /// `path`. Lets tests mutate a table inside the window between listing
    /// keys and deleting them.
    pub fn after_next_snapshot<F>(&self, path: impl AsRef<Path>, hook: F)
    where
        F: FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>) + Send + 'static,
    {
        let registry = self.registry.lock().unwrap();
        if let Some(map) = registry.maps.get(path.as_ref()) {
            map.lock().unwrap().after_snapshot = Some(Box::new(hook));
        }
    }
}

impl TableBackend for MemoryBackend {
    fn ensure_pin_dir(&self, dir: &Path) -> io::Result<()> {
        let mut registry = self.registry.lock().unwrap();
        if registry.failing_dirs.contains(dir) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "permission denied",
            ));
        }
        registry.dirs.insert(dir.to_path_buf());
        Ok(())
    }

    fn get_or_create<const K: usize, const V: usize>(
        &self,
        spec: &TableSpec,
    ) -> Result<Box<dyn RawTable>> {
        spec.check_key(K)?;
        spec.check_value(V)?;

        let mut registry = self.registry.lock().unwrap();
        if let Some(map) = registry.maps.get(&spec.path) {
            {
                let existing = map.lock().unwrap();
                spec.check_key(existing.key_size)?;
                spec.check_value(existing.value_size)?;
            }
            return Ok(Box::new(MemoryTable {
                spec: spec.clone(),
                map: Arc::clone(map),
            }));
        }

        let dir_missing = spec.pin_dir().is_some_and(|dir| !registry.dirs.contains(dir));
        if dir_missing {
            return Err(TableError::Pin {
                path: spec.path.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "pin directory missing"),
            });
        }

        let map = Arc::new(Mutex::new(MemoryMap {
            key_size: spec.key_size,
            value_size: spec.value_size,
            capacity: spec.capacity,
            entries: BTreeMap::new(),
            after_snapshot: None,
        }));
        registry.maps.insert(spec.path.clone(), Arc::clone(&map));
        registry.creates += 1;

        Ok(Box::new(MemoryTable {
            spec: spec.clone(),
            map,
        }))
    }
}

/// Handle to one in-memory table.
pub struct MemoryTable {
    spec: TableSpec,
    map: Arc<Mutex<MemoryMap>>,
}

impl RawTable for MemoryTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.spec.check_key(key.len())?;
        Ok(self.map.lock().unwrap().entries.get(key).cloned())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.spec.check_key(key.len())?;
        self.spec.check_value(value.len())?;

        let mut map = self.map.lock().unwrap();
        if !map.entries.contains_key(key) && map.entries.len() >= map.capacity as usize {
            return Err(TableError::TableFull {
                table: self.spec.name.clone(),
                capacity: map.capacity,
            });
        }
        map.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.spec.check_key(key.len())?;
        Ok(self.map.lock().unwrap().entries.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut map = self.map.lock().unwrap();
        let keys = map.entries.keys().cloned().collect();
        if let Some(hook) = map.after_snapshot.take() {
            hook(&mut map.entries);
        }
        Ok(keys)
    }
}
