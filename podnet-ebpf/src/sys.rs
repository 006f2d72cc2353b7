//! Raw bpf(2) calls aya does not expose: creating a standalone map and
//! pinning it.
//!
//! Everything else goes through aya once the map is pinned.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

// bpf(2) commands
const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_OBJ_PIN: libc::c_int = 6;

pub const BPF_MAP_TYPE_HASH: u32 = 1;

/// BPF_OBJ_NAME_LEN, including the trailing NUL.
const BPF_OBJ_NAME_LEN: usize = 16;

/// Leading fields of `union bpf_attr` for BPF_MAP_CREATE.
/// The kernel accepts a shorter attr as long as the size is passed along.
#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

/// `union bpf_attr` for BPF_OBJ_PIN / BPF_OBJ_GET.
#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn sys_bpf<T>(cmd: libc::c_int, attr: &T) -> io::Result<libc::c_long> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const T,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Kernel map names: at most 15 chars of `[A-Za-z0-9_.]`.
pub fn is_valid_map_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < BPF_OBJ_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
}

/// Create a `BPF_MAP_TYPE_HASH` map and return its fd.
///
/// The map lives as long as the fd or a pin references it.
pub fn create_hash_map(
    name: &str,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<OwnedFd> {
    if !is_valid_map_name(name) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid map name '{}'", name),
        ));
    }

    let mut attr = MapCreateAttr {
        map_type: BPF_MAP_TYPE_HASH,
        key_size,
        value_size,
        max_entries,
        ..Default::default()
    };
    attr.map_name[..name.len()].copy_from_slice(name.as_bytes());

    let fd = sys_bpf(BPF_MAP_CREATE, &attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

/// Pin a BPF object at `path` on a bpffs mount.
///
/// Fails with `AlreadyExists` if something is pinned there already.
pub fn pin_object(fd: BorrowedFd<'_>, path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pin path contains NUL"))?;

    let attr = ObjAttr {
        pathname: c_path.as_ptr() as u64,
        bpf_fd: fd.as_raw_fd() as u32,
        file_flags: 0,
    };
    sys_bpf(BPF_OBJ_PIN, &attr)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_names() {
        assert!(is_valid_map_name("lxc_map"));
        assert!(is_valid_map_name("pod.map_v2"));
        assert!(!is_valid_map_name(""));
        assert!(!is_valid_map_name("this_name_is_too_long"));
        assert!(!is_valid_map_name("pod-map"));
    }

    #[test]
    fn test_attr_layouts() {
        // Offsets fixed by the kernel uapi
        assert_eq!(mem::size_of::<MapCreateAttr>(), 44);
        assert_eq!(mem::size_of::<ObjAttr>(), 16);
    }
}
