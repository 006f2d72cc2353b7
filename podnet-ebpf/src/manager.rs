//! The three forwarding tables, opened together.

use crate::error::{Result, TableError};
use crate::record::{
    DeviceKind, EndpointInfo, EndpointKey, LocalDeviceKey, LocalDeviceValue, PodNodeKey,
    PodNodeValue, Record,
};
use crate::table::{BatchOutcome, ReconcileReport, Table, TableBackend, TableSpec};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default capacity of every table.
pub const MAX_ENTRIES: u32 = 1024;

/// Default bpffs directory holding the pins.
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/podnet";

pub const ENDPOINT_MAP: &str = "lxc_map";
pub const REMOTE_POD_MAP: &str = "pod_map";
pub const LOCAL_DEVICE_MAP: &str = "local_map";

/// Pin locations and capacity of the tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablePaths {
    pub endpoints: PathBuf,
    pub remote_pods: PathBuf,
    pub local_devices: PathBuf,
    pub capacity: u32,
}

impl Default for TablePaths {
    fn default() -> Self {
        Self::in_dir(DEFAULT_PIN_DIR)
    }
}

impl TablePaths {
    /// All three tables under one directory with their default names.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            endpoints: dir.join(ENDPOINT_MAP),
            remote_pods: dir.join(REMOTE_POD_MAP),
            local_devices: dir.join(LOCAL_DEVICE_MAP),
            capacity: MAX_ENTRIES,
        }
    }

    /// Distinct pin directories, in table order.
    pub fn pin_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for path in [&self.endpoints, &self.remote_pods, &self.local_devices] {
            let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
                continue;
            };
            if !dirs.iter().any(|d| d == dir) {
                dirs.push(dir.to_path_buf());
            }
        }
        dirs
    }
}

/// Kernel map name for a pin: the file name, or `fallback` if there is none.
fn map_name<'a>(path: &'a Path, fallback: &'a str) -> &'a str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(fallback)
}

fn open<B, K, V, const KS: usize, const VS: usize>(
    backend: &B,
    path: &Path,
    fallback: &str,
    capacity: u32,
) -> Result<Table<K, V>>
where
    B: TableBackend,
    K: Record,
    V: Record,
{
    let spec = TableSpec::for_records::<K, V>(path, map_name(path, fallback), capacity);
    let raw = backend.get_or_create::<KS, VS>(&spec)?;
    Ok(Table::new(raw))
}

type EndpointTable = Table<EndpointKey, EndpointInfo>;
type RemotePodTable = Table<PodNodeKey, PodNodeValue>;
type LocalDeviceTable = Table<LocalDeviceKey, LocalDeviceValue>;

/// Handle to the endpoint, remote-pod and local-device tables.
///
/// Built once per process with [`TableManager::init`] and passed to whatever
/// needs it.
pub struct TableManager {
    endpoints: EndpointTable,
    remote_pods: RemotePodTable,
    local_devices: LocalDeviceTable,
}

impl TableManager {
    /// Create the pin directories and open (or create) all three tables.
    ///
    /// Stops at the first directory that cannot be created and reports it.
    pub fn init<B: TableBackend>(backend: &B, paths: &TablePaths) -> Result<Self> {
        for dir in paths.pin_dirs() {
            backend
                .ensure_pin_dir(&dir)
                .map_err(|source| TableError::PinDir {
                    path: dir.clone(),
                    source,
                })?;
            debug!(dir = %dir.display(), "Pin directory ready");
        }

        let endpoints: EndpointTable =
            open::<_, _, _, { EndpointKey::SIZE }, { EndpointInfo::SIZE }>(
                backend,
                &paths.endpoints,
                ENDPOINT_MAP,
                paths.capacity,
            )?;
        let remote_pods: RemotePodTable =
            open::<_, _, _, { PodNodeKey::SIZE }, { PodNodeValue::SIZE }>(
                backend,
                &paths.remote_pods,
                REMOTE_POD_MAP,
                paths.capacity,
            )?;
        let local_devices: LocalDeviceTable =
            open::<_, _, _, { LocalDeviceKey::SIZE }, { LocalDeviceValue::SIZE }>(
                backend,
                &paths.local_devices,
                LOCAL_DEVICE_MAP,
                paths.capacity,
            )?;

        info!(
            endpoints = %paths.endpoints.display(),
            remote_pods = %paths.remote_pods.display(),
            local_devices = %paths.local_devices.display(),
            "Forwarding tables ready"
        );

        Ok(Self {
            endpoints,
            remote_pods,
            local_devices,
        })
    }

    pub fn endpoints(&self) -> &Table<EndpointKey, EndpointInfo> {
        &self.endpoints
    }

    pub fn endpoints_mut(&mut self) -> &mut Table<EndpointKey, EndpointInfo> {
        &mut self.endpoints
    }

    pub fn remote_pods(&self) -> &Table<PodNodeKey, PodNodeValue> {
        &self.remote_pods
    }

    pub fn remote_pods_mut(&mut self) -> &mut Table<PodNodeKey, PodNodeValue> {
        &mut self.remote_pods
    }

    pub fn local_devices(&self) -> &Table<LocalDeviceKey, LocalDeviceValue> {
        &self.local_devices
    }

    pub fn local_devices_mut(&mut self) -> &mut Table<LocalDeviceKey, LocalDeviceValue> {
        &mut self.local_devices
    }

    // ========== Endpoint operations ==========

    pub fn set_endpoint(&mut self, ip: Ipv4Addr, info: &EndpointInfo) -> Result<()> {
        self.endpoints.set(&EndpointKey::new(ip), info)?;
        debug!(%ip, %info, "Endpoint entry written");
        Ok(())
    }

    /// Endpoint entry for `ip`, `None` if absent.
    pub fn endpoint(&self, ip: Ipv4Addr) -> Result<Option<EndpointInfo>> {
        match self.endpoints.get(&EndpointKey::new(ip)) {
            Ok(info) => Ok(Some(info)),
            Err(TableError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove_endpoint(&mut self, ip: Ipv4Addr) -> Result<()> {
        self.endpoints.delete(&EndpointKey::new(ip))?;
        debug!(%ip, "Endpoint entry removed");
        Ok(())
    }

    // ========== Remote pod operations ==========

    /// Replace the remote-pod table with exactly `routes` (pod CIDR to
    /// tunnel endpoint).
    pub fn sync_remote_pods(&mut self, routes: &[(Ipv4Net, Ipv4Addr)]) -> Result<ReconcileReport> {
        let desired: Vec<_> = routes
            .iter()
            .map(|(cidr, tunnel_endpoint)| {
                (
                    PodNodeKey::new(*cidr),
                    PodNodeValue {
                        tunnel_endpoint: *tunnel_endpoint,
                    },
                )
            })
            .collect();
        self.remote_pods.reconcile(&desired)
    }

    pub fn delete_all_remote_pods(&mut self) -> Result<BatchOutcome> {
        self.remote_pods.delete_all()
    }

    // ========== Local device operations ==========

    pub fn set_local_device(&mut self, kind: DeviceKind, value: &LocalDeviceValue) -> Result<()> {
        self.local_devices.set(&LocalDeviceKey { kind }, value)?;
        debug!(kind = kind.as_str(), %value, "Local device entry written");
        Ok(())
    }

    pub fn local_device(&self, kind: DeviceKind) -> Result<Option<LocalDeviceValue>> {
        match self.local_devices.get(&LocalDeviceKey { kind }) {
            Ok(value) => Ok(Some(value)),
            Err(TableError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Clear all three tables. Every table is attempted; the first failure
    /// is reported after the rest have been cleared.
    pub fn flush_all(&mut self) -> Result<usize> {
        let outcomes = [
            self.endpoints.delete_all(),
            self.remote_pods.delete_all(),
            self.local_devices.delete_all(),
        ];

        let mut removed = 0;
        let mut first_error = None;
        for outcome in outcomes {
            match outcome.and_then(BatchOutcome::into_result) {
                Ok(n) => removed += n,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(removed, "Flushed forwarding tables");
                Ok(removed)
            }
        }
    }
}
