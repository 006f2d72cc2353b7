//! Fixed-layout records shared with the kernel fast path.
//!
//! The fast path reads these bytes directly, so every record has an explicit
//! encoder and decoder instead of relying on Rust struct layout. IPv4
//! addresses are stored in network byte order, integers little-endian
//! (the programs are built for `bpfel`), and padding is always zero.

use crate::error::RecordError;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// A value with a fixed binary encoding of exactly `SIZE` bytes.
pub trait Record: Sized {
    /// Encoded width in bytes.
    const SIZE: usize;

    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, RecordError>;
}

fn check_len(bytes: &[u8], expected: usize) -> Result<(), RecordError> {
    if bytes.len() != expected {
        return Err(RecordError::Length {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn check_zero(bytes: &[u8], start: usize, end: usize) -> Result<(), RecordError> {
    match bytes[start..end].iter().position(|&b| b != 0) {
        Some(i) => Err(RecordError::Padding(start + i)),
        None => Ok(()),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_ipv4(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    )
}

fn read_mac(bytes: &[u8], offset: usize) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[offset..offset + 6]);
    mac
}

// ========== Endpoint table ==========

/// Endpoint table key: a local pod's IPv4 address.
///
/// | offset | width | field |
/// |--------|-------|-------|
/// | 0      | 4     | ip (network order) |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub ip: Ipv4Addr,
}

impl EndpointKey {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self { ip }
    }
}

impl Record for EndpointKey {
    const SIZE: usize = 4;

    fn encode(&self) -> Vec<u8> {
        self.ip.octets().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, Self::SIZE)?;
        Ok(Self {
            ip: read_ipv4(bytes, 0),
        })
    }
}

/// Endpoint table value: how to deliver to a local pod.
///
/// | offset | width | field |
/// |--------|-------|-------|
/// | 0      | 4     | if_index (host-side veth, LE) |
/// | 4      | 4     | lxc_if_index (pod-side interface, LE) |
/// | 8      | 6     | mac (pod interface) |
/// | 14     | 2     | padding |
/// | 16     | 6     | node_mac (host-side veth) |
/// | 22     | 2     | padding |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    pub if_index: u32,
    pub lxc_if_index: u32,
    pub mac: [u8; 6],
    pub node_mac: [u8; 6],
}

impl Record for EndpointInfo {
    const SIZE: usize = 24;

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.if_index.to_le_bytes());
        buf[4..8].copy_from_slice(&self.lxc_if_index.to_le_bytes());
        buf[8..14].copy_from_slice(&self.mac);
        buf[16..22].copy_from_slice(&self.node_mac);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, Self::SIZE)?;
        check_zero(bytes, 14, 16)?;
        check_zero(bytes, 22, 24)?;
        Ok(Self {
            if_index: read_u32(bytes, 0),
            lxc_if_index: read_u32(bytes, 4),
            mac: read_mac(bytes, 8),
            node_mac: read_mac(bytes, 16),
        })
    }
}

// ========== Remote pod table ==========

/// Remote pod table key: a peer node's pod CIDR.
///
/// | offset | width | field |
/// |--------|-------|-------|
/// | 0      | 4     | network address (network order) |
/// | 4      | 1     | prefix length |
/// | 5      | 3     | padding |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PodNodeKey {
    pub pod_cidr: Ipv4Net,
}

impl PodNodeKey {
    /// Host bits are cleared so equal subnets always encode identically.
    pub fn new(pod_cidr: Ipv4Net) -> Self {
        Self {
            pod_cidr: pod_cidr.trunc(),
        }
    }
}

impl Record for PodNodeKey {
    const SIZE: usize = 8;

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.pod_cidr.network().octets());
        buf[4] = self.pod_cidr.prefix_len();
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, Self::SIZE)?;
        check_zero(bytes, 5, 8)?;
        let prefix_len = bytes[4];
        let pod_cidr = Ipv4Net::new(read_ipv4(bytes, 0), prefix_len)
            .map_err(|_| RecordError::PrefixLen(prefix_len))?;
        Ok(Self::new(pod_cidr))
    }
}

/// Remote pod table value: the overlay destination for that CIDR.
///
/// | offset | width | field |
/// |--------|-------|-------|
/// | 0      | 4     | tunnel endpoint (network order) |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PodNodeValue {
    pub tunnel_endpoint: Ipv4Addr,
}

impl Record for PodNodeValue {
    const SIZE: usize = 4;

    fn encode(&self) -> Vec<u8> {
        self.tunnel_endpoint.octets().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, Self::SIZE)?;
        Ok(Self {
            tunnel_endpoint: read_ipv4(bytes, 0),
        })
    }
}

// ========== Local device table ==========

/// Node-local devices the fast path needs to recognise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceKind {
    Uplink = 1,
    Bridge = 2,
    Vxlan = 3,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Uplink => "uplink",
            DeviceKind::Bridge => "bridge",
            DeviceKind::Vxlan => "vxlan",
        }
    }
}

impl TryFrom<u32> for DeviceKind {
    type Error = RecordError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(DeviceKind::Uplink),
            2 => Ok(DeviceKind::Bridge),
            3 => Ok(DeviceKind::Vxlan),
            other => Err(RecordError::DeviceKind(other)),
        }
    }
}

/// Local device table key.
///
/// | offset | width | field |
/// |--------|-------|-------|
/// | 0      | 4     | kind (LE) |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocalDeviceKey {
    pub kind: DeviceKind,
}

impl Record for LocalDeviceKey {
    const SIZE: usize = 4;

    fn encode(&self) -> Vec<u8> {
        (self.kind as u32).to_le_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, Self::SIZE)?;
        Ok(Self {
            kind: DeviceKind::try_from(read_u32(bytes, 0))?,
        })
    }
}

/// Local device table value.
///
/// | offset | width | field |
/// |--------|-------|-------|
/// | 0      | 4     | if_index (LE) |
/// | 4      | 6     | mac |
/// | 10     | 2     | padding |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalDeviceValue {
    pub if_index: u32,
    pub mac: [u8; 6],
}

impl Record for LocalDeviceValue {
    const SIZE: usize = 12;

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.if_index.to_le_bytes());
        buf[4..10].copy_from_slice(&self.mac);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        check_len(bytes, Self::SIZE)?;
        check_zero(bytes, 10, 12)?;
        Ok(Self {
            if_index: read_u32(bytes, 0),
            mac: read_mac(bytes, 4),
        })
    }
}

// ========== MAC helpers ==========

/// Parse MAC address string to bytes.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

/// Format MAC address bytes as string.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "if_index={} lxc_if_index={} mac={} node_mac={}",
            self.if_index,
            self.lxc_if_index,
            format_mac(&self.mac),
            format_mac(&self.node_mac)
        )
    }
}

impl fmt::Display for LocalDeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if_index={} mac={}", self.if_index, format_mac(&self.mac))
    }
}
