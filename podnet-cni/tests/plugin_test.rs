//! ADD/CHECK/DEL flows against in-memory tables, an in-memory address store
//! and a fake wiring layer.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use podnet_cni::error::{CODE_CHECK, CODE_TABLES, CODE_WIRING};
use podnet_cni::wiring::Result as WiringResult;
use podnet_cni::{
    AttachRequest, Attachment, CmdArgs, LinkInfo, NetConf, Plugin, Wiring, WiringError, delete,
    host_veth_name,
};
use podnet_ebpf::test_util::MemoryBackend;
use podnet_ebpf::{DeviceKind, EndpointInfo, TableManager, TablePaths};
use podnet_ipam::{CoordinationStore, Ipam, IpamOptions, LeaseState, MemoryStore};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

const CONF: &str = r#"{
    "cniVersion": "1.0.0",
    "name": "podnet",
    "type": "podnet",
    "subnet": "10.244.0.0/16",
    "node": {"name": "node-a", "interface": "eth0", "tunnelEndpoint": "192.168.1.11"}
}"#;

#[derive(Default)]
struct FakeState {
    links: HashMap<String, LinkInfo>,
    pod_links: HashMap<(String, String), LinkInfo>,
    routes: BTreeMap<Ipv4Net, Ipv4Addr>,
    next_index: u32,
    fail_attach: bool,
    attaches: usize,
    detached: Vec<String>,
}

/// Keeps links and routes in memory instead of touching the host.
struct FakeWiring {
    state: Mutex<FakeState>,
}

impl FakeWiring {
    fn new() -> Self {
        let mut state = FakeState {
            next_index: 10,
            ..Default::default()
        };
        state.links.insert(
            "eth0".to_string(),
            LinkInfo {
                if_index: 2,
                mac: [0x02, 0, 0, 0, 0, 0xe0],
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    fn failing() -> Self {
        let wiring = Self::new();
        wiring.state.lock().unwrap().fail_attach = true;
        wiring
    }

    fn add_link(&self, name: &str, link: LinkInfo) {
        self.state.lock().unwrap().links.insert(name.to_string(), link);
    }

    fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(name)
    }

    fn detached(&self) -> Vec<String> {
        self.state.lock().unwrap().detached.clone()
    }

    fn attaches(&self) -> usize {
        self.state.lock().unwrap().attaches
    }

    fn routes(&self) -> BTreeMap<Ipv4Net, Ipv4Addr> {
        self.state.lock().unwrap().routes.clone()
    }

    fn set_pod_mac(&self, netns: &str, ifname: &str, mac: [u8; 6]) {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state
            .pod_links
            .get_mut(&(netns.to_string(), ifname.to_string()))
        {
            link.mac = mac;
        }
    }
}

#[async_trait]
impl Wiring for FakeWiring {
    async fn attach(&self, req: &AttachRequest) -> WiringResult<Attachment> {
        let mut state = self.state.lock().unwrap();
        state.attaches += 1;
        if state.fail_attach {
            return Err(WiringError::Command {
                command: "ip link add".to_string(),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }

        if !state.links.contains_key(&req.bridge) {
            state.links.insert(
                req.bridge.clone(),
                LinkInfo {
                    if_index: 3,
                    mac: [0x02, 0, 0, 0, 0, 0xb0],
                },
            );
        }

        state.next_index += 2;
        let n = state.next_index;
        let host = LinkInfo {
            if_index: n,
            mac: [0x02, 0, 0, 0, 0, n as u8],
        };
        let pod = LinkInfo {
            if_index: n + 1,
            mac: [0x52, 0x54, 0, 0, 0, (n + 1) as u8],
        };
        state.links.insert(req.host_veth.clone(), host);
        state
            .pod_links
            .insert((req.netns.clone(), req.ifname.clone()), pod);
        Ok(Attachment { host, pod })
    }

    async fn detach(&self, host_veth: &str) -> WiringResult<()> {
        let mut state = self.state.lock().unwrap();
        state.links.remove(host_veth);
        state.detached.push(host_veth.to_string());
        Ok(())
    }

    async fn link_info(&self, name: &str) -> WiringResult<LinkInfo> {
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .copied()
            .ok_or_else(|| WiringError::LinkNotFound(name.to_string()))
    }

    async fn pod_link_info(&self, netns: &str, ifname: &str) -> WiringResult<LinkInfo> {
        self.state
            .lock()
            .unwrap()
            .pod_links
            .get(&(netns.to_string(), ifname.to_string()))
            .copied()
            .ok_or_else(|| WiringError::LinkNotFound(ifname.to_string()))
    }

    async fn install_remote_routes(&self, routes: &[(Ipv4Net, Ipv4Addr)]) -> WiringResult<()> {
        let mut state = self.state.lock().unwrap();
        for (cidr, endpoint) in routes {
            state.routes.insert(*cidr, *endpoint);
        }
        Ok(())
    }

    async fn remove_remote_routes(&self, cidrs: &[Ipv4Net]) -> WiringResult<()> {
        let mut state = self.state.lock().unwrap();
        for cidr in cidrs {
            state.routes.remove(cidr);
        }
        Ok(())
    }
}

fn conf() -> NetConf {
    NetConf::parse(CONF.as_bytes()).unwrap()
}

fn args(container_id: &str) -> CmdArgs {
    CmdArgs {
        container_id: container_id.to_string(),
        netns: format!("/var/run/netns/{}", container_id),
        ifname: "eth0".to_string(),
        ..Default::default()
    }
}

fn paths(capacity: u32) -> TablePaths {
    TablePaths {
        capacity,
        ..TablePaths::in_dir("/sys/fs/bpf/podnet")
    }
}

async fn ipam(store: &MemoryStore, conf: &NetConf) -> Ipam {
    let store: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    Ipam::init(conf.subnet, store, conf.ipam_options())
        .await
        .unwrap()
}

async fn plugin_with(
    store: &MemoryStore,
    backend: &MemoryBackend,
    capacity: u32,
    wiring: FakeWiring,
) -> Plugin<FakeWiring> {
    let conf = conf();
    let ipam = ipam(store, &conf).await;
    let tables = TableManager::init(backend, &paths(capacity)).unwrap();
    Plugin::new(conf, ipam, tables, wiring)
}

async fn plugin(store: &MemoryStore) -> Plugin<FakeWiring> {
    plugin_with(store, &MemoryBackend::new(), 64, FakeWiring::new()).await
}

#[tokio::test]
async fn test_add_wires_pod_and_writes_endpoint() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let args = args("c1");

    let result = plugin.add(&args).await.unwrap();

    let ip = Ipv4Addr::new(10, 244, 0, 2);
    assert_eq!(result.ips.len(), 1);
    assert_eq!(result.ips[0].address, "10.244.0.2/24".parse::<Ipv4Net>().unwrap());
    assert_eq!(result.ips[0].gateway, Ipv4Addr::new(10, 244, 0, 1));
    assert_eq!(result.interfaces[0].name, host_veth_name("c1", "eth0"));
    assert_eq!(result.interfaces[1].sandbox.as_deref(), Some("/var/run/netns/c1"));

    let host = plugin
        .wiring()
        .link_info(&host_veth_name("c1", "eth0"))
        .await
        .unwrap();
    let entry = plugin.tables().endpoint(ip).unwrap().unwrap();
    assert_eq!(entry.if_index, host.if_index);
    assert_eq!(entry.node_mac, host.mac);
    assert_eq!(entry.lxc_if_index, host.if_index + 1);

    let lease = plugin.ipam().lease(ip).await.unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Reserved);
    assert_eq!(lease.container_id.as_deref(), Some("c1"));

    let bridge = plugin.tables().local_device(DeviceKind::Bridge).unwrap().unwrap();
    assert_eq!(bridge.if_index, 3);
    let uplink = plugin.tables().local_device(DeviceKind::Uplink).unwrap().unwrap();
    assert_eq!(uplink.if_index, 2);
}

#[tokio::test]
async fn test_add_without_uplink_registers_overlay_device() {
    let conf = NetConf::parse(
        br#"{
            "cniVersion": "1.0.0",
            "name": "podnet",
            "type": "podnet",
            "subnet": "10.244.0.0/16",
            "node": {
                "name": "node-a",
                "tunnelEndpoint": "192.168.1.11",
                "vxlanDevice": "vxlan0"
            }
        }"#,
    )
    .unwrap();
    let store = MemoryStore::new();
    let ipam = ipam(&store, &conf).await;
    assert!(ipam.host_network().interface.is_empty());

    let wiring = FakeWiring::new();
    wiring.add_link(
        "vxlan0",
        LinkInfo {
            if_index: 4,
            mac: [0x02, 0, 0, 0, 0, 0x40],
        },
    );
    let tables = TableManager::init(&MemoryBackend::new(), &paths(64)).unwrap();
    let mut plugin = Plugin::new(conf, ipam, tables, wiring);

    plugin.add(&args("c1")).await.unwrap();

    let vxlan = plugin.tables().local_device(DeviceKind::Vxlan).unwrap().unwrap();
    assert_eq!(vxlan.if_index, 4);
    assert!(plugin.tables().local_device(DeviceKind::Bridge).unwrap().is_some());
    assert!(plugin.tables().local_device(DeviceKind::Uplink).unwrap().is_none());
}

#[tokio::test]
async fn test_add_twice_keeps_address() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let args = args("c1");

    let first = plugin.add(&args).await.unwrap();
    let second = plugin.add(&args).await.unwrap();

    assert_eq!(first.ips[0].address, second.ips[0].address);
    assert_eq!(plugin.wiring().attaches(), 2);
    let reserved: Vec<_> = plugin
        .ipam()
        .leases()
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.is_reserved())
        .collect();
    assert_eq!(reserved.len(), 1);
}

#[tokio::test]
async fn test_distinct_pods_get_distinct_addresses() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;

    let a = plugin.add(&args("c1")).await.unwrap();
    let b = plugin.add(&args("c2")).await.unwrap();
    assert_ne!(a.ips[0].address, b.ips[0].address);
}

#[tokio::test]
async fn test_add_wiring_failure_releases_address() {
    let store = MemoryStore::new();
    let mut plugin =
        plugin_with(&store, &MemoryBackend::new(), 64, FakeWiring::failing()).await;

    let err = plugin.add(&args("c1")).await.unwrap_err();
    assert_eq!(err.code(), CODE_WIRING);

    let ip = Ipv4Addr::new(10, 244, 0, 2);
    let lease = plugin.ipam().lease(ip).await.unwrap().unwrap();
    assert_eq!(lease.state, LeaseState::Released);
    assert!(plugin.ipam().owned_lease("c1", "eth0").await.unwrap().is_none());
    assert!(plugin.tables().endpoints().is_empty().unwrap());

    // The address goes to the next pod
    let mut ok = plugin_with(&store, &MemoryBackend::new(), 64, FakeWiring::new()).await;
    let result = ok.add(&args("c2")).await.unwrap();
    assert_eq!(result.ips[0].address.addr(), ip);
}

#[tokio::test]
async fn test_add_table_failure_detaches_and_releases() {
    let store = MemoryStore::new();
    let backend = MemoryBackend::new();

    // Fill the single endpoint slot with someone else
    let mut filler = TableManager::init(&backend, &paths(1)).unwrap();
    filler
        .set_endpoint(
            Ipv4Addr::new(10, 244, 9, 9),
            &EndpointInfo {
                if_index: 99,
                lxc_if_index: 98,
                mac: [0x52, 0x54, 0, 0, 0, 0x99],
                node_mac: [0x02, 0, 0, 0, 0, 0x99],
            },
        )
        .unwrap();

    let mut plugin = plugin_with(&store, &backend, 1, FakeWiring::new()).await;
    let err = plugin.add(&args("c1")).await.unwrap_err();
    assert_eq!(err.code(), CODE_TABLES);

    let host_veth = host_veth_name("c1", "eth0");
    assert_eq!(plugin.wiring().detached(), vec![host_veth.clone()]);
    assert!(!plugin.wiring().has_link(&host_veth));
    assert!(plugin.ipam().owned_lease("c1", "eth0").await.unwrap().is_none());
    assert_eq!(plugin.tables().endpoints().len().unwrap(), 1);
}

#[tokio::test]
async fn test_add_rejects_missing_netns() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let mut args = args("c1");
    args.netns.clear();

    let err = plugin.add(&args).await.unwrap_err();
    assert_eq!(err.code(), 4);
    assert!(plugin.ipam().leases().await.unwrap().is_empty());
    assert_eq!(plugin.wiring().attaches(), 0);
}

#[tokio::test]
async fn test_add_syncs_remote_pods_from_peers() {
    let store = MemoryStore::new();

    // A second node registers first and takes 10.244.0.0/24
    let peer_conf = conf();
    let peer = Ipam::init(
        peer_conf.subnet,
        Arc::new(store.clone()),
        IpamOptions {
            node_name: Some("node-b".to_string()),
            interface: Some("eth0".to_string()),
            tunnel_endpoint: Some(Ipv4Addr::new(192, 168, 1, 12)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut plugin = plugin(&store).await;
    let result = plugin.add(&args("c1")).await.unwrap();
    assert_eq!(result.ips[0].address, "10.244.1.1/24".parse::<Ipv4Net>().unwrap());

    let remote = plugin.tables().remote_pods().entries().unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].0.pod_cidr, peer.pod_cidr());
    assert_eq!(remote[0].1.tunnel_endpoint, Ipv4Addr::new(192, 168, 1, 12));
    assert_eq!(
        plugin.wiring().routes().get(&peer.pod_cidr()),
        Some(&Ipv4Addr::new(192, 168, 1, 12))
    );
}

#[tokio::test]
async fn test_check_after_add() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let args = args("c1");

    plugin.add(&args).await.unwrap();
    plugin.check(&args).await.unwrap();

    plugin.wiring().set_pod_mac(&args.netns, &args.ifname, [0x52, 0x54, 0, 0, 0, 0xff]);
    let err = plugin.check(&args).await.unwrap_err();
    assert_eq!(err.code(), CODE_CHECK);
}

#[tokio::test]
async fn test_check_without_add_fails() {
    let store = MemoryStore::new();
    let plugin = plugin(&store).await;
    let err = plugin.check(&args("c1")).await.unwrap_err();
    assert_eq!(err.code(), CODE_CHECK);
}

#[tokio::test]
async fn test_del_releases_and_cleans_up() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let args = args("c1");
    plugin.add(&args).await.unwrap();

    let report = plugin.del(&args).await;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.released, vec![Ipv4Addr::new(10, 244, 0, 2)]);
    assert!(plugin.tables().endpoints().is_empty().unwrap());
    assert!(!plugin.wiring().has_link(&host_veth_name("c1", "eth0")));

    // Repeated DEL is harmless
    let again = plugin.del(&args).await;
    assert!(again.is_clean(), "{:?}", again.failures);
    assert!(again.released.is_empty());
}

#[tokio::test]
async fn test_del_never_fails_when_store_is_down() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let args = args("c1");
    plugin.add(&args).await.unwrap();

    store.set_unavailable(true);
    let report = plugin.del(&args).await;

    assert!(!report.is_clean());
    assert!(report.failures[0].starts_with("release"));
    // Local state goes anyway, found through the veth's ifindex
    assert!(plugin.tables().endpoints().is_empty().unwrap());
    assert!(!plugin.wiring().has_link(&host_veth_name("c1", "eth0")));
}

#[tokio::test]
async fn test_del_without_store_or_tables() {
    let wiring = FakeWiring::new();
    let report = delete(None, None, &wiring, &args("c1")).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(wiring.detached(), vec![host_veth_name("c1", "eth0")]);
}

#[tokio::test]
async fn test_del_with_bad_args_reports_instead_of_failing() {
    let store = MemoryStore::new();
    let mut plugin = plugin(&store).await;
    let report = plugin.del(&CmdArgs::default()).await;

    assert!(!report.is_clean());
    assert!(plugin.wiring().detached().is_empty());
}
