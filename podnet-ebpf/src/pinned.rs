//! Kernel-backed tables pinned on bpffs.

use crate::error::{Result, TableError};
use crate::sys;
use crate::table::{RawTable, TableBackend, TableSpec};
use aya::maps::{HashMap, Map, MapData, MapError};
use std::io;
use std::os::fd::AsFd;
use std::path::Path;
use tracing::{debug, info};

/// Tables pinned under a bpffs mount (normally `/sys/fs/bpf`).
#[derive(Clone, Copy, Debug, Default)]
pub struct BpfFs;

fn errno(err: &MapError) -> Option<i32> {
    match err {
        MapError::SyscallError(e) => std::error::Error::source(e)
            .and_then(|s| s.downcast_ref::<io::Error>())
            .and_then(io::Error::raw_os_error),
        _ => None,
    }
}

fn size_error(spec: &TableSpec, err: MapError) -> TableError {
    match err {
        MapError::InvalidKeySize { size, expected } => TableError::SizeMismatch {
            table: spec.name.clone(),
            field: "key",
            expected,
            actual: size,
        },
        MapError::InvalidValueSize { size, expected } => TableError::SizeMismatch {
            table: spec.name.clone(),
            field: "value",
            expected,
            actual: size,
        },
        source => TableError::Open {
            path: spec.path.clone(),
            source,
        },
    }
}

fn create_and_pin(spec: &TableSpec) -> Result<()> {
    if !sys::is_valid_map_name(&spec.name) {
        return Err(TableError::InvalidName(spec.name.clone()));
    }

    let fd = sys::create_hash_map(
        &spec.name,
        spec.key_size as u32,
        spec.value_size as u32,
        spec.capacity,
    )
    .map_err(|source| TableError::Create {
        name: spec.name.clone(),
        source,
    })?;

    match sys::pin_object(fd.as_fd(), &spec.path) {
        Ok(()) => {
            info!(
                name = %spec.name,
                path = %spec.path.display(),
                key_size = spec.key_size,
                value_size = spec.value_size,
                capacity = spec.capacity,
                "Created and pinned map"
            );
            Ok(())
        }
        // Another invocation pinned first; its map wins and ours is dropped
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %spec.path.display(), "Map pinned concurrently, attaching");
            Ok(())
        }
        Err(source) => Err(TableError::Pin {
            path: spec.path.clone(),
            source,
        }),
    }
}

impl TableBackend for BpfFs {
    fn ensure_pin_dir(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }

    fn get_or_create<const K: usize, const V: usize>(
        &self,
        spec: &TableSpec,
    ) -> Result<Box<dyn RawTable>> {
        spec.check_key(K)?;
        spec.check_value(V)?;

        let data = match MapData::from_pin(&spec.path) {
            Ok(data) => {
                debug!(path = %spec.path.display(), "Attached to pinned map");
                data
            }
            Err(e) if errno(&e) == Some(libc::ENOENT) => {
                create_and_pin(spec)?;
                MapData::from_pin(&spec.path).map_err(|source| TableError::Open {
                    path: spec.path.clone(),
                    source,
                })?
            }
            Err(source) => {
                return Err(TableError::Open {
                    path: spec.path.clone(),
                    source,
                });
            }
        };

        let map = HashMap::<MapData, [u8; K], [u8; V]>::try_from(Map::HashMap(data))
            .map_err(|e| size_error(spec, e))?;

        Ok(Box::new(PinnedTable {
            spec: spec.clone(),
            map,
        }))
    }
}

/// A pinned `BPF_MAP_TYPE_HASH` with `K`-byte keys and `V`-byte values.
pub struct PinnedTable<const K: usize, const V: usize> {
    spec: TableSpec,
    map: HashMap<MapData, [u8; K], [u8; V]>,
}

impl<const K: usize, const V: usize> PinnedTable<K, V> {
    fn key(&self, key: &[u8]) -> Result<[u8; K]> {
        self.spec.check_key(key.len())?;
        let mut out = [0u8; K];
        out.copy_from_slice(key);
        Ok(out)
    }

    fn value(&self, value: &[u8]) -> Result<[u8; V]> {
        self.spec.check_value(value.len())?;
        let mut out = [0u8; V];
        out.copy_from_slice(value);
        Ok(out)
    }
}

impl<const K: usize, const V: usize> RawTable for PinnedTable<K, V> {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = self.key(key)?;
        match self.map.get(&key, 0) {
            Ok(value) => Ok(Some(value.to_vec())),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let key = self.key(key)?;
        let value = self.value(value)?;
        match self.map.insert(key, value, 0) {
            Ok(()) => Ok(()),
            Err(e) if errno(&e) == Some(libc::E2BIG) => Err(TableError::TableFull {
                table: self.spec.name.clone(),
                capacity: self.spec.capacity,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let key = self.key(key)?;
        match self.map.remove(&key) {
            Ok(()) => Ok(true),
            Err(e) if errno(&e) == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.map
            .keys()
            .map(|key| key.map(|k| k.to_vec()).map_err(TableError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EndpointInfo, EndpointKey, Record};
    use crate::table::Table;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ensure_pin_dir_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("bpf/podnet");
        BpfFs.ensure_pin_dir(&dir).unwrap();
        assert!(dir.is_dir());
        // Second call is a no-op
        BpfFs.ensure_pin_dir(&dir).unwrap();
    }

    #[test]
    fn test_rejects_spec_with_wrong_widths() {
        let spec = TableSpec::new("/sys/fs/bpf/podnet/x", "x", 4, 8, 16);
        let result = BpfFs.get_or_create::<4, 24>(&spec);
        assert!(matches!(
            result,
            Err(TableError::SizeMismatch {
                field: "value",
                expected: 8,
                actual: 24,
                ..
            })
        ));
    }

    /// Requires CAP_BPF and a bpffs mount - run with:
    ///   sudo -E cargo test --package podnet-ebpf -- --ignored
    #[test]
    #[ignore]
    fn test_pinned_round_trip() {
        let path = format!("/sys/fs/bpf/podnet_test_{}", std::process::id());
        let spec = TableSpec::for_records::<EndpointKey, EndpointInfo>(&path, "podnet_test", 16);

        let raw = BpfFs
            .get_or_create::<{ EndpointKey::SIZE }, { EndpointInfo::SIZE }>(&spec)
            .unwrap();
        let mut table: Table<EndpointKey, EndpointInfo> = Table::new(raw);

        let key = EndpointKey::new(Ipv4Addr::new(10, 244, 0, 2));
        let info = EndpointInfo {
            if_index: 3,
            lxc_if_index: 2,
            mac: [0x52, 0x54, 0, 0, 0, 1],
            node_mac: [0x02, 0, 0, 0, 0, 1],
        };
        table.set(&key, &info).unwrap();

        // Second handle sees the same kernel map
        let again = BpfFs
            .get_or_create::<{ EndpointKey::SIZE }, { EndpointInfo::SIZE }>(&spec)
            .unwrap();
        let again: Table<EndpointKey, EndpointInfo> = Table::new(again);
        assert_eq!(again.get(&key).unwrap(), info);

        assert_eq!(table.delete_all().unwrap().applied, 1);
        let _ = std::fs::remove_file(&path);
    }
}
