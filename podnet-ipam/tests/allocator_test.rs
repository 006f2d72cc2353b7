//! Allocation behaviour against the in-memory coordination store.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use podnet_ipam::{
    CoordinationStore, HostNetwork, Ipam, IpamError, IpamOptions, KeyValue, LeaseOwner,
    LeaseState, MemoryStore, StoreResult,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const SUBNET: &str = "10.244.0.0/16";

fn options(name: &str, last_octet: u8) -> IpamOptions {
    IpamOptions {
        node_name: Some(name.to_string()),
        interface: Some("eth0".to_string()),
        tunnel_endpoint: Some(Ipv4Addr::new(192, 168, 1, last_octet)),
        ..Default::default()
    }
}

async fn init(store: Arc<dyn CoordinationStore>, opts: IpamOptions) -> Ipam {
    Ipam::init(SUBNET.parse().unwrap(), store, opts).await.unwrap()
}

#[tokio::test]
async fn test_gateway_strings() {
    let store = Arc::new(MemoryStore::new());
    let ipam = init(store, options("node-a", 11)).await;

    assert_eq!(ipam.gateway(), Ipv4Addr::new(10, 244, 0, 1));
    assert_eq!(ipam.gateway_with_mask_segment(), "10.244.0.1/16");
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let first = init(store.clone(), options("node-a", 11)).await;
    let second = init(store.clone(), options("node-a", 11)).await;

    assert_eq!(first.pod_cidr(), second.pod_cidr());
    assert_eq!(first.host_network(), second.host_network());
    assert_eq!(second.all_host_network().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_nodes_get_distinct_slices() {
    let store = Arc::new(MemoryStore::new());
    let a = init(store.clone(), options("node-a", 11)).await;
    let b = init(store.clone(), options("node-b", 12)).await;

    assert_eq!(a.pod_cidr(), "10.244.0.0/24".parse::<Ipv4Net>().unwrap());
    assert_eq!(b.pod_cidr(), "10.244.1.0/24".parse::<Ipv4Net>().unwrap());

    let peers: Vec<String> = a.peers().await.unwrap().into_iter().map(|h| h.name).collect();
    assert_eq!(peers, vec!["node-b".to_string()]);
    assert_eq!(b.unused_ip().await.unwrap(), Ipv4Addr::new(10, 244, 1, 1));
}

#[tokio::test]
async fn test_no_slice_left() {
    let store = Arc::new(MemoryStore::new());
    let subnet: Ipv4Net = "10.244.0.0/23".parse().unwrap();
    for name in ["a", "b"] {
        Ipam::init(subnet, store.clone(), options(name, 11))
            .await
            .unwrap();
    }
    let err = Ipam::init(subnet, store.clone(), options("c", 13))
        .await
        .unwrap_err();
    assert!(matches!(err, IpamError::NoNodeSubnet { prefix_len: 24, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_are_distinct() {
    let store = Arc::new(MemoryStore::new());
    // Registration happens once; every invocation afterwards is its own Ipam
    init(store.clone(), options("node-a", 11)).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let ipam = init(store, options("node-a", 11)).await;
            let owner = LeaseOwner::new(format!("c{}", i), "eth0");
            ipam.reserve(Some(&owner)).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let ip = handle.await.unwrap();
        assert!(seen.insert(ip), "address {} handed out twice", ip);
    }
    assert_eq!(seen.len(), 32);
}

#[tokio::test]
async fn test_exhaustion() {
    let store = Arc::new(MemoryStore::new());
    let mut opts = options("node-a", 11);
    opts.node_prefix_len = Some(29);
    let ipam = init(store, opts).await;

    // 10.244.0.0/29: .1 is the gateway, .0 and .7 are not hosts
    let mut got = Vec::new();
    for _ in 0..5 {
        got.push(ipam.unused_ip().await.unwrap());
    }
    assert_eq!(got.first(), Some(&Ipv4Addr::new(10, 244, 0, 2)));
    assert_eq!(got.last(), Some(&Ipv4Addr::new(10, 244, 0, 6)));

    let err = ipam.unused_ip().await.unwrap_err();
    assert!(matches!(err, IpamError::AllocationExhausted(_)));
}

#[tokio::test]
async fn test_released_address_is_reused() {
    let store = Arc::new(MemoryStore::new());
    let ipam = init(store, options("node-a", 11)).await;

    let first = ipam.unused_ip().await.unwrap();
    let _second = ipam.unused_ip().await.unwrap();
    ipam.release(&[first]).await.unwrap();

    assert_eq!(
        ipam.lease(first).await.unwrap().unwrap().state,
        LeaseState::Released
    );
    assert_eq!(ipam.unused_ip().await.unwrap(), first);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let ipam = init(store, options("node-a", 11)).await;

    let ip = ipam.unused_ip().await.unwrap();
    ipam.release(&[ip]).await.unwrap();
    ipam.release(&[ip]).await.unwrap();
    // Never allocated
    ipam.release(&[Ipv4Addr::new(10, 244, 0, 200)]).await.unwrap();
}

#[tokio::test]
async fn test_release_owner_only_touches_its_leases() {
    let store = Arc::new(MemoryStore::new());
    let ipam = init(store, options("node-a", 11)).await;

    let mine = LeaseOwner::new("abc", "eth0");
    let other = LeaseOwner::new("def", "eth0");
    let my_ip = ipam.reserve(Some(&mine)).await.unwrap();
    let other_ip = ipam.reserve(Some(&other)).await.unwrap();

    assert_eq!(
        ipam.owned_lease("abc", "eth0").await.unwrap().map(|l| l.ip),
        Some(my_ip)
    );
    assert_eq!(ipam.release_owner("abc", "eth0").await.unwrap(), vec![my_ip]);
    assert!(ipam.release_owner("abc", "eth0").await.unwrap().is_empty());
    assert!(ipam.owned_lease("abc", "eth0").await.unwrap().is_none());
    assert!(ipam.lease(other_ip).await.unwrap().unwrap().is_reserved());
}

#[tokio::test]
async fn test_store_unavailable_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let ipam = init(store.clone(), options("node-a", 11)).await;
    store.set_unavailable(true);

    let err = ipam.unused_ip().await.unwrap_err();
    assert!(err.is_store_unavailable());
}

/// Store that lets a competitor grab the first lease key we try to create.
struct StealingStore {
    inner: MemoryStore,
    stolen: AtomicBool,
}

#[async_trait]
impl CoordinationStore for StealingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.inner.list(prefix).await
    }

    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        if key.contains("/leases/") && !self.stolen.swap(true, Ordering::SeqCst) {
            self.inner.put(key, value).await?;
        }
        self.inner.create(key, value).await
    }

    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64> {
        self.inner.compare_and_swap(key, version, value).await
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()> {
        self.inner.compare_and_delete(key, version).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.inner.put(key, value).await
    }
}

#[tokio::test]
async fn test_lost_race_moves_to_next_candidate() {
    let store = Arc::new(StealingStore {
        inner: MemoryStore::new(),
        stolen: AtomicBool::new(false),
    });
    let ipam = init(store.clone(), options("node-a", 11)).await;

    assert_eq!(ipam.unused_ip().await.unwrap(), Ipv4Addr::new(10, 244, 0, 3));
    // The competitor's lease is intact
    assert!(
        ipam.lease(Ipv4Addr::new(10, 244, 0, 2))
            .await
            .unwrap()
            .unwrap()
            .is_reserved()
    );
}

/// Store that hands control back to the runtime before every call, so two
/// invocations joined on one task interleave step by step.
struct YieldingStore {
    inner: MemoryStore,
}

#[async_trait]
impl CoordinationStore for YieldingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        tokio::task::yield_now().await;
        self.inner.list(prefix).await
    }

    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.inner.create(key, value).await
    }

    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.inner.compare_and_swap(key, version, value).await
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.inner.compare_and_delete(key, version).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.inner.put(key, value).await
    }
}

#[tokio::test]
async fn test_concurrent_first_registration_agrees_on_slice() {
    let store = Arc::new(YieldingStore {
        inner: MemoryStore::new(),
    });

    let (a, b) = tokio::join!(
        init(store.clone(), options("node-a", 11)),
        init(store.clone(), options("node-a", 11)),
    );
    assert_eq!(a.pod_cidr(), b.pod_cidr());

    let nodes = a.all_host_network().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].pod_cidr, a.pod_cidr());

    let claims = store.list("/podnet/ipam/slices/").await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].value, b"node-a".to_vec());

    let (ip_a, ip_b) = tokio::join!(a.unused_ip(), b.unused_ip());
    let (ip_a, ip_b) = (ip_a.unwrap(), ip_b.unwrap());
    assert_ne!(ip_a, ip_b);
    assert!(a.pod_cidr().contains(&ip_a));
    assert!(a.pod_cidr().contains(&ip_b));
}

/// Store where another invocation of the same node registers a different
/// slice just before our first node record write.
struct RegisteringStore {
    inner: MemoryStore,
    raced: AtomicBool,
}

#[async_trait]
impl CoordinationStore for RegisteringStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.inner.list(prefix).await
    }

    async fn create(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        if key.contains("/nodes/") && !self.raced.swap(true, Ordering::SeqCst) {
            let record = HostNetwork {
                name: "node-a".to_string(),
                interface: "eth0".to_string(),
                tunnel_endpoint: Ipv4Addr::new(192, 168, 1, 11),
                pod_cidr: "10.244.5.0/24".parse().unwrap(),
                updated_at: chrono::Utc::now(),
            };
            self.inner
                .create("/podnet/ipam/slices/10.244.5.0-24", b"node-a")
                .await?;
            self.inner
                .create(key, &serde_json::to_vec(&record).unwrap())
                .await?;
        }
        self.inner.create(key, value).await
    }

    async fn compare_and_swap(&self, key: &str, version: u64, value: &[u8]) -> StoreResult<u64> {
        self.inner.compare_and_swap(key, version, value).await
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> StoreResult<()> {
        self.inner.compare_and_delete(key, version).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.inner.put(key, value).await
    }
}

#[tokio::test]
async fn test_lost_registration_adopts_recorded_slice() {
    let store = Arc::new(RegisteringStore {
        inner: MemoryStore::new(),
        raced: AtomicBool::new(false),
    });
    let ipam = init(store.clone(), options("node-a", 11)).await;

    let recorded: Ipv4Net = "10.244.5.0/24".parse().unwrap();
    assert_eq!(ipam.pod_cidr(), recorded);
    assert_eq!(ipam.unused_ip().await.unwrap(), Ipv4Addr::new(10, 244, 5, 1));

    // The slice claimed before losing the race is given back
    let claims: Vec<String> = store
        .list("/podnet/ipam/slices/")
        .await
        .unwrap()
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(claims, vec!["/podnet/ipam/slices/10.244.5.0-24".to_string()]);
}

#[tokio::test]
async fn test_unreadable_records_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let ipam = init(store.clone(), options("node-a", 11)).await;
    let owner = LeaseOwner::new("abc", "eth0");
    let ip = ipam.reserve(Some(&owner)).await.unwrap();

    store
        .put("/podnet/ipam/leases/10.244.9.9", b"garbage")
        .await
        .unwrap();
    store.put("/podnet/ipam/nodes/broken", b"{").await.unwrap();

    assert_eq!(ipam.leases().await.unwrap().len(), 1);
    assert_eq!(
        ipam.owned_lease("abc", "eth0").await.unwrap().map(|l| l.ip),
        Some(ip)
    );
    assert_eq!(ipam.release_owner("abc", "eth0").await.unwrap(), vec![ip]);
    assert!(ipam.peers().await.unwrap().is_empty());
    assert_eq!(ipam.all_host_network().await.unwrap().len(), 1);
}
