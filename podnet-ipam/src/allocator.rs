//! Cluster-wide pod address allocation.
//!
//! # Keyspace
//!
//! ```text
//! <prefix>/nodes/<name>            HostNetwork JSON, written by the node itself
//! <prefix>/slices/<net>-<len>      node name, claimed with put-if-absent
//! <prefix>/leases/<ip>             Lease JSON
//! ```
//!
//! Every plugin invocation is a separate process. Uniqueness comes only from
//! the store's conditional writes: a new lease key is created with
//! put-if-absent, a released lease is taken over with compare-and-swap on the
//! version that was read. Losing either race just moves on to the next
//! candidate.

use crate::error::{IpamError, Result, StoreError};
use crate::host::{self, HostNetwork};
use crate::store::{CoordinationStore, KeyValue};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_KEY_PREFIX: &str = "/podnet/ipam";

/// Default per-node slice length.
pub const DEFAULT_NODE_PREFIX_LEN: u8 = 24;

/// Full passes over the candidate range before giving up under contention.
pub const MAX_ALLOCATION_ROUNDS: usize = 3;

const MAX_WRITE_ATTEMPTS: usize = 5;

/// How this node takes part in allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamOptions {
    /// Defaults to the hostname.
    pub node_name: Option<String>,
    /// Uplink used to detect the tunnel endpoint.
    pub interface: Option<String>,
    /// Skips detection when set.
    pub tunnel_endpoint: Option<Ipv4Addr>,
    pub key_prefix: String,
    /// Per-node slice length. `None` shares the whole subnet between nodes.
    pub node_prefix_len: Option<u8>,
}

impl Default for IpamOptions {
    fn default() -> Self {
        Self {
            node_name: None,
            interface: None,
            tunnel_endpoint: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            node_prefix_len: Some(DEFAULT_NODE_PREFIX_LEN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Reserved,
    Released,
}

/// Who holds a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOwner {
    pub container_id: String,
    pub ifname: String,
}

impl LeaseOwner {
    pub fn new(container_id: impl Into<String>, ifname: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ifname: ifname.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
    pub state: LeaseState,
    pub updated_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_reserved(&self) -> bool {
        self.state == LeaseState::Reserved
    }

    pub fn is_owned_by(&self, container_id: &str, ifname: &str) -> bool {
        self.container_id.as_deref() == Some(container_id) && self.ifname.as_deref() == Some(ifname)
    }
}

/// Store key layout under one prefix.
#[derive(Debug, Clone)]
struct Keyspace {
    prefix: String,
}

impl Keyspace {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn nodes(&self) -> String {
        format!("{}/nodes/", self.prefix)
    }

    fn node(&self, name: &str) -> String {
        format!("{}{}", self.nodes(), name)
    }

    fn slices(&self) -> String {
        format!("{}/slices/", self.prefix)
    }

    fn slice(&self, net: &Ipv4Net) -> String {
        format!("{}{}-{}", self.slices(), net.network(), net.prefix_len())
    }

    fn leases(&self) -> String {
        format!("{}/leases/", self.prefix)
    }

    fn lease(&self, ip: Ipv4Addr) -> String {
        format!("{}{}", self.leases(), ip)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kv: &KeyValue) -> Result<T> {
    serde_json::from_slice(&kv.value).map_err(|source| IpamError::Corrupt {
        key: kv.key.clone(),
        source,
    })
}

/// Decode every record that parses, skipping the rest.
fn decode_readable<T: serde::de::DeserializeOwned>(kvs: &[KeyValue]) -> Vec<T> {
    kvs.iter()
        .filter_map(|kv| {
            decode(kv)
                .inspect_err(|e| warn!(key = %kv.key, error = %e, "Skipping unreadable record"))
                .ok()
        })
        .collect()
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| IpamError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// Address allocator for one node.
pub struct Ipam {
    subnet: Ipv4Net,
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
    host: HostNetwork,
}

impl std::fmt::Debug for Ipam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipam")
            .field("subnet", &self.subnet)
            .field("prefix", &self.keys.prefix)
            .field("host", &self.host)
            .finish()
    }
}

impl Ipam {
    /// Register this node and prepare to allocate from its slice.
    ///
    /// Safe to call on every invocation: an existing registration is reused
    /// and only rewritten if the tunnel endpoint or interface changed.
    ///
    /// The node record is written with create or compare-and-swap. When a
    /// concurrent invocation of the same node wins that write, its slice is
    /// adopted and the one claimed here is given back, so the slice claim
    /// and the node record always agree.
    pub async fn init(
        subnet: Ipv4Net,
        store: Arc<dyn CoordinationStore>,
        options: IpamOptions,
    ) -> Result<Self> {
        let subnet = subnet.trunc();
        if subnet.prefix_len() > 30 {
            return Err(IpamError::InvalidOption(format!(
                "subnet {} has no room for pods",
                subnet
            )));
        }
        if let Some(len) = options.node_prefix_len {
            if len < subnet.prefix_len() || len > 30 {
                return Err(IpamError::InvalidNodePrefix {
                    subnet,
                    prefix_len: len,
                });
            }
        }
        if options.key_prefix.trim_end_matches('/').is_empty() {
            return Err(IpamError::InvalidOption("empty key prefix".to_string()));
        }

        let name = options.node_name.clone().unwrap_or_else(host::default_node_name);
        if name.is_empty() || name.contains('/') {
            return Err(IpamError::InvalidOption(format!("invalid node name '{}'", name)));
        }

        let (interface, tunnel_endpoint) = match options.tunnel_endpoint {
            Some(ip) => (options.interface.clone().unwrap_or_default(), ip),
            None => host::detect_tunnel_endpoint(options.interface.as_deref())?,
        };

        let keys = Keyspace::new(&options.key_prefix);
        let node_key = keys.node(&name);

        let mut claimed = None;
        let mut host = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = store.get(&node_key).await?;
            let existing = match &current {
                Some(kv) => Some(decode::<HostNetwork>(kv)?),
                None => None,
            };

            let pod_cidr = match &existing {
                Some(h) if Self::slice_fits(subnet, options.node_prefix_len, h.pod_cidr) => {
                    h.pod_cidr
                }
                _ => match claimed {
                    Some(slice) => slice,
                    None => {
                        let slice = Self::claim_slice(
                            &*store,
                            &keys,
                            subnet,
                            options.node_prefix_len,
                            &name,
                        )
                        .await?;
                        claimed = Some(slice);
                        slice
                    }
                },
            };

            if let Some(h) = existing {
                if h.pod_cidr == pod_cidr
                    && h.tunnel_endpoint == tunnel_endpoint
                    && h.interface == interface
                {
                    debug!(node = %name, %pod_cidr, "Node already registered");
                    host = Some(h);
                    break;
                }
            }

            let record = HostNetwork {
                name: name.clone(),
                interface: interface.clone(),
                tunnel_endpoint,
                pod_cidr,
                updated_at: Utc::now(),
            };
            let value = encode(&node_key, &record)?;
            let written = match &current {
                Some(kv) => store.compare_and_swap(&node_key, kv.version, &value).await,
                None => store.create(&node_key, &value).await,
            };
            match written {
                Ok(_) => {
                    info!(
                        node = %name,
                        %pod_cidr,
                        %tunnel_endpoint,
                        "Registered node network"
                    );
                    host = Some(record);
                    break;
                }
                Err(e) if e.is_conflict() => {
                    debug!(node = %name, "Node record changed concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(host) = host else {
            return Err(IpamError::Contention {
                key: node_key,
                attempts: MAX_WRITE_ATTEMPTS,
            });
        };

        if let Some(slice) = claimed {
            if slice != host.pod_cidr {
                Self::drop_claim(&*store, &keys, slice, &name).await;
            }
        }

        Ok(Self {
            subnet,
            store,
            keys,
            host,
        })
    }

    fn slice_fits(subnet: Ipv4Net, node_prefix_len: Option<u8>, cidr: Ipv4Net) -> bool {
        match node_prefix_len {
            Some(len) => cidr.prefix_len() == len && subnet.contains(&cidr),
            None => cidr == subnet,
        }
    }

    /// Claim the first free slice, or reuse one this node already claimed.
    async fn claim_slice(
        store: &dyn CoordinationStore,
        keys: &Keyspace,
        subnet: Ipv4Net,
        node_prefix_len: Option<u8>,
        name: &str,
    ) -> Result<Ipv4Net> {
        let Some(len) = node_prefix_len else {
            return Ok(subnet);
        };

        let claims: HashMap<String, String> = store
            .list(&keys.slices())
            .await?
            .into_iter()
            .map(|kv| (kv.key, String::from_utf8_lossy(&kv.value).into_owned()))
            .collect();

        let slices = subnet
            .subnets(len)
            .map_err(|_| IpamError::InvalidNodePrefix {
                subnet,
                prefix_len: len,
            })?;

        for slice in slices {
            let key = keys.slice(&slice);
            match claims.get(&key) {
                Some(owner) if owner == name => {
                    debug!(node = %name, %slice, "Reusing claimed slice");
                    return Ok(slice);
                }
                Some(_) => continue,
                None => {}
            }
            match store.create(&key, name.as_bytes()).await {
                Ok(_) => {
                    info!(node = %name, %slice, "Claimed node slice");
                    return Ok(slice);
                }
                Err(e) if e.is_conflict() => {
                    let owner = store.get(&key).await?;
                    if owner.is_some_and(|kv| kv.value == name.as_bytes()) {
                        debug!(node = %name, %slice, "Slice claimed concurrently by this node");
                        return Ok(slice);
                    }
                    debug!(%slice, "Slice claimed concurrently, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IpamError::NoNodeSubnet {
            subnet,
            prefix_len: len,
        })
    }

    /// Give back a slice claim the node record ended up not using.
    async fn drop_claim(
        store: &dyn CoordinationStore,
        keys: &Keyspace,
        slice: Ipv4Net,
        name: &str,
    ) {
        let key = keys.slice(&slice);
        let result = match store.get(&key).await {
            Ok(Some(kv)) if kv.value == name.as_bytes() => {
                store.compare_and_delete(&key, kv.version).await
            }
            Ok(_) => return,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(node = %name, %slice, "Dropped unused slice claim"),
            Err(e) => {
                warn!(node = %name, %slice, error = %e, "Failed to drop unused slice claim")
            }
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// This node's slice of the subnet.
    pub fn pod_cidr(&self) -> Ipv4Net {
        self.host.pod_cidr
    }

    pub fn node_name(&self) -> &str {
        &self.host.name
    }

    /// This node's registration.
    pub fn host_network(&self) -> &HostNetwork {
        &self.host
    }

    /// First address of the subnet, shared by every node's bridge.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + 1)
    }

    /// Gateway with the subnet's mask, e.g. `10.244.0.1/16`.
    pub fn gateway_with_mask_segment(&self) -> String {
        format!("{}/{}", self.gateway(), self.subnet.prefix_len())
    }

    /// Addresses of this node's slice that may be handed out, in order.
    fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let slice = self.host.pod_cidr;
        let first = u32::from(slice.network()) + 1;
        let last = u32::from(slice.broadcast()).saturating_sub(1);
        let gateway = self.gateway();
        (first..=last)
            .map(Ipv4Addr::from)
            .filter(move |ip| *ip != gateway && self.subnet.contains(ip))
    }

    /// Leases by address with the version they were read at. Unreadable
    /// leases are treated as taken.
    async fn lease_index(&self) -> Result<HashMap<Ipv4Addr, (Option<Lease>, u64)>> {
        let prefix = self.keys.leases();
        let mut index = HashMap::new();
        for kv in self.store.list(&prefix).await? {
            let Some(ip) = kv.key[prefix.len()..].parse::<Ipv4Addr>().ok() else {
                warn!(key = %kv.key, "Ignoring lease with malformed key");
                continue;
            };
            match decode::<Lease>(&kv) {
                Ok(lease) => index.insert(ip, (Some(lease), kv.version)),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "Treating unreadable lease as taken");
                    index.insert(ip, (None, kv.version))
                }
            };
        }
        Ok(index)
    }

    fn new_lease(&self, ip: Ipv4Addr, owner: Option<&LeaseOwner>) -> Lease {
        Lease {
            ip,
            node: self.host.name.clone(),
            container_id: owner.map(|o| o.container_id.clone()),
            ifname: owner.map(|o| o.ifname.clone()),
            state: LeaseState::Reserved,
            updated_at: Utc::now(),
        }
    }

    /// Reserve an unused address without recording an owner.
    pub async fn unused_ip(&self) -> Result<Ipv4Addr> {
        self.reserve(None).await
    }

    /// Reserve an unused address of this node's slice.
    pub async fn reserve(&self, owner: Option<&LeaseOwner>) -> Result<Ipv4Addr> {
        for round in 0..MAX_ALLOCATION_ROUNDS {
            let index = self.lease_index().await?;
            let mut contended = false;

            for ip in self.candidates() {
                let key = self.keys.lease(ip);
                let result = match index.get(&ip) {
                    None => {
                        let lease = self.new_lease(ip, owner);
                        self.store.create(&key, &encode(&key, &lease)?).await
                    }
                    Some((Some(lease), version)) if !lease.is_reserved() => {
                        let lease = self.new_lease(ip, owner);
                        self.store
                            .compare_and_swap(&key, *version, &encode(&key, &lease)?)
                            .await
                    }
                    Some(_) => continue,
                };

                match result {
                    Ok(_) => {
                        info!(
                            %ip,
                            node = %self.host.name,
                            container_id = owner.map(|o| o.container_id.as_str()),
                            "Reserved address"
                        );
                        return Ok(ip);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(%ip, round, "Lost race for address, trying next");
                        contended = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if !contended {
                break;
            }
        }

        warn!(pod_cidr = %self.host.pod_cidr, "No free address");
        Err(IpamError::AllocationExhausted(self.host.pod_cidr))
    }

    /// Mark addresses as released. Absent or already released leases are
    /// not errors.
    pub async fn release(&self, ips: &[Ipv4Addr]) -> Result<()> {
        for ip in ips {
            self.release_if(*ip, |_| true).await?;
        }
        Ok(())
    }

    /// Release whatever `container_id`/`ifname` holds. Returns the released
    /// addresses.
    pub async fn release_owner(&self, container_id: &str, ifname: &str) -> Result<Vec<Ipv4Addr>> {
        let owned: Vec<Ipv4Addr> = self
            .leases()
            .await?
            .into_iter()
            .filter(|l| l.is_reserved() && l.is_owned_by(container_id, ifname))
            .map(|l| l.ip)
            .collect();

        let mut released = Vec::with_capacity(owned.len());
        for ip in owned {
            if self
                .release_if(ip, |l| l.is_owned_by(container_id, ifname))
                .await?
            {
                released.push(ip);
            }
        }
        Ok(released)
    }

    /// CAS one lease to released if `pred` holds. Returns whether this call
    /// released it.
    async fn release_if(&self, ip: Ipv4Addr, pred: impl Fn(&Lease) -> bool) -> Result<bool> {
        let key = self.keys.lease(ip);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(kv) = self.store.get(&key).await? else {
                debug!(%ip, "Release of unknown address");
                return Ok(false);
            };
            let mut lease: Lease = decode(&kv)?;
            if !lease.is_reserved() || !pred(&lease) {
                return Ok(false);
            }

            lease.state = LeaseState::Released;
            lease.updated_at = Utc::now();
            match self
                .store
                .compare_and_swap(&key, kv.version, &encode(&key, &lease)?)
                .await
            {
                Ok(_) => {
                    info!(%ip, container_id = lease.container_id.as_deref(), "Released address");
                    return Ok(true);
                }
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(IpamError::Contention {
            key,
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    pub async fn lease(&self, ip: Ipv4Addr) -> Result<Option<Lease>> {
        match self.store.get(&self.keys.lease(ip)).await? {
            Some(kv) => Ok(Some(decode(&kv)?)),
            None => Ok(None),
        }
    }

    /// Every lease in the cluster, reserved or not.
    pub async fn leases(&self) -> Result<Vec<Lease>> {
        Ok(decode_readable(&self.store.list(&self.keys.leases()).await?))
    }

    /// The reserved lease held by `container_id`/`ifname`, if any.
    pub async fn owned_lease(&self, container_id: &str, ifname: &str) -> Result<Option<Lease>> {
        Ok(self
            .leases()
            .await?
            .into_iter()
            .find(|l| l.is_reserved() && l.is_owned_by(container_id, ifname)))
    }

    /// Every registered node, this one included.
    pub async fn all_host_network(&self) -> Result<Vec<HostNetwork>> {
        Ok(decode_readable(&self.store.list(&self.keys.nodes()).await?))
    }

    /// Every registered node except this one.
    pub async fn peers(&self) -> Result<Vec<HostNetwork>> {
        Ok(self
            .all_host_network()
            .await?
            .into_iter()
            .filter(|h| h.name != self.host.name)
            .collect())
    }
}
