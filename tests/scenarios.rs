//! End-to-end scenarios driving the public component surface directly
//! against real UDP gossip transports and the in-process fake engine.

use kvsupervisor::bootstrap::{BootstrapConfig, BootstrapController, BootstrapState};
use kvsupervisor::cluster_info::{self, ClusterInfo};
use kvsupervisor::crypto as shared_crypto;
use kvsupervisor::engine::tests::{new_registry, FakeEngine};
use kvsupervisor::engine::{KvEngine, PeerSpec, StartMode};
use kvsupervisor::eviction::{EvictionConfig, EvictionController};
use kvsupervisor::membership::{GossipMembership, Member, MembershipConfig, NodeStatus};
use kvsupervisor::snapshot::blob::FileBlobStore;
use kvsupervisor::snapshot::{SnapshotConfig, SnapshotPipeline};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Binds a UDP socket on an OS-assigned port, reads back its address, then
/// releases it. Good enough for wiring up gossip addresses ahead of
/// `GossipMembership::bind` in single-process, sequential test setup.
async fn free_udp_addr() -> SocketAddr {
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.local_addr().unwrap()
}

async fn gossip_node(name: &str, gossip_addr: SocketAddr, bootstrap_addrs: Vec<SocketAddr>) -> Arc<GossipMembership> {
    gossip_node_with_peer_url(name, &format!("http://{name}.peer"), gossip_addr, bootstrap_addrs).await
}

async fn gossip_node_with_peer_url(
    name: &str,
    peer_url: &str,
    gossip_addr: SocketAddr,
    bootstrap_addrs: Vec<SocketAddr>,
) -> Arc<GossipMembership> {
    let local = Member::new(name, format!("http://{name}.client"), peer_url, gossip_addr);
    let config = MembershipConfig {
        local,
        bootstrap_addrs,
        protocol_period: Duration::from_millis(50),
        transport_key: None,
    };
    Arc::new(GossipMembership::bind(config).await.unwrap())
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, poll: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

async fn wait_until_async<F, Fut>(timeout: Duration, poll: Duration, cond: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[tokio::test]
async fn single_node_start_reaches_ready() {
    let engine: Arc<dyn KvEngine> = Arc::new(FakeEngine::new());
    let config = BootstrapConfig {
        required_cluster_size: 1,
        self_peer: PeerSpec { name: "solo".into(), peer_url: "http://solo".into() },
        name_lock_ttl: Duration::from_secs(10),
        bootstrap_timeout: Duration::from_secs(60),
        join_attempt_timeout: Duration::from_secs(30),
    };
    let controller = BootstrapController::new(config, engine.clone(), None, None);

    let state = controller.run(CancellationToken::new()).await.unwrap();

    assert_eq!(state, BootstrapState::Ready);
    assert!(engine.is_ready().await);
    let info_bytes = engine.get(cluster_info::CLUSTER_INFO_KEY).await.unwrap().unwrap();
    let info = ClusterInfo::decode(&info_bytes).unwrap();
    assert_eq!(info.required_cluster_size, 1);
}

#[tokio::test]
async fn three_node_cluster_forms_from_scratch() {
    let addrs = [free_udp_addr().await, free_udp_addr().await, free_udp_addr().await];
    let names = ["a", "b", "c"];

    let mut gossips = Vec::new();
    for i in 0..3 {
        let others: Vec<SocketAddr> = addrs.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, a)| *a).collect();
        gossips.push(gossip_node(names[i], addrs[i], others).await);
    }

    let ctx = CancellationToken::new();
    let mut handles = Vec::new();
    for i in 0..3 {
        let gossip = gossips[i].clone();
        let engine: Arc<dyn KvEngine> = Arc::new(FakeEngine::new());
        let config = BootstrapConfig {
            required_cluster_size: 3,
            self_peer: PeerSpec { name: names[i].into(), peer_url: format!("http://{}.peer", names[i]) },
            name_lock_ttl: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(30),
            join_attempt_timeout: Duration::from_secs(10),
        };
        let controller = BootstrapController::new(config, engine.clone(), Some(gossip), None);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move { controller.run(ctx).await }));
    }

    let results = tokio::time::timeout(Duration::from_secs(20), futures_join_all(handles)).await.expect(
        "three-node bootstrap did not converge within the test deadline",
    );

    for result in results {
        assert_eq!(result.unwrap().unwrap(), BootstrapState::Ready);
    }
}

/// Minimal stand-in for `futures::future::join_all` so this crate doesn't
/// need the `futures` dependency just for one test helper.
async fn futures_join_all<T>(handles: Vec<tokio::task::JoinHandle<T>>) -> Vec<Result<T, tokio::task::JoinError>> {
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await);
    }
    out
}

#[tokio::test]
async fn node_joins_cluster_that_is_already_running() {
    let registry = new_registry();
    let names = ["node1", "node2", "node3"];
    let running_peers: Vec<PeerSpec> = names
        .iter()
        .map(|n| PeerSpec { name: (*n).into(), peer_url: format!("http://{n}.peer") })
        .collect();

    let mut gossip_addrs = Vec::new();
    for _ in 0..3 {
        gossip_addrs.push(free_udp_addr().await);
    }

    let ctx = CancellationToken::new();
    let mut gossips = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let engine = FakeEngine::new_registered(format!("http://{name}.client"), &registry);
        engine.start(&running_peers, StartMode::NewCluster).await.unwrap();

        let others: Vec<SocketAddr> = gossip_addrs.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, a)| *a).collect();
        let local = Member::new(*name, format!("http://{name}.client"), format!("http://{name}.peer"), gossip_addrs[i]);
        let config = MembershipConfig { local, bootstrap_addrs: others, protocol_period: Duration::from_millis(50), transport_key: None };
        let gossip = Arc::new(GossipMembership::bind(config).await.unwrap());
        gossip.start(ctx.clone()).await.unwrap();
        gossip.update(NodeStatus::Running).await.unwrap();
        gossips.push(gossip);
    }

    let converged = wait_until_async(Duration::from_secs(5), Duration::from_millis(50), || async { gossips[0].running_members().await.len() >= 3 }).await;
    assert!(converged, "pre-existing 3-node cluster did not converge in gossip before the new node joined");

    let node4_addr = free_udp_addr().await;
    let node4_gossip = gossip_node("node4", node4_addr, vec![gossip_addrs[0]]).await;
    let node4_engine: Arc<dyn KvEngine> = FakeEngine::new_joining("http://node4.client", &registry);

    let config = BootstrapConfig {
        required_cluster_size: 3,
        self_peer: PeerSpec { name: "node4".into(), peer_url: "http://node4.peer".into() },
        name_lock_ttl: Duration::from_secs(10),
        bootstrap_timeout: Duration::from_secs(30),
        join_attempt_timeout: Duration::from_secs(10),
    };
    let controller = BootstrapController::new(config, node4_engine.clone(), Some(node4_gossip), None);

    let state = tokio::time::timeout(Duration::from_secs(20), controller.run(ctx.clone()))
        .await
        .expect("node4 did not finish bootstrap within the test deadline")
        .unwrap();

    assert_eq!(state, BootstrapState::Ready);
    assert!(node4_engine.is_ready().await);
    for peer in &running_peers {
        let found = node4_engine.find_member_by_peer_url(&peer.peer_url).await.unwrap();
        assert!(found.is_some(), "node4 never learned about {}", peer.peer_url);
    }

    ctx.cancel();
}

#[tokio::test]
async fn duplicate_peer_url_triggers_immediate_eviction() {
    use kvsupervisor::common::{HealthStatus, SupervisedComponent};

    let self_addr = free_udp_addr().await;
    let third_addr = free_udp_addr().await;
    let impostor_addr = free_udp_addr().await;

    let engine = Arc::new(FakeEngine::new());
    engine
        .start(
            &[
                PeerSpec { name: "original".into(), peer_url: "http://dup.peer".into() },
                PeerSpec { name: "third".into(), peer_url: "http://third.peer".into() },
            ],
            StartMode::NewCluster,
        )
        .await
        .unwrap();

    let ctx = CancellationToken::new();

    // Two real, running gossip nodes ("self" and "third") hold quorum for a
    // required_cluster_size of 3 before the impostor ever shows up.
    let self_gossip = gossip_node("self", self_addr, vec![]).await;
    self_gossip.start(ctx.clone()).await.unwrap();
    self_gossip.update(NodeStatus::Running).await.unwrap();

    let third_gossip = gossip_node("third", third_addr, vec![self_addr]).await;
    third_gossip.start(ctx.clone()).await.unwrap();
    third_gossip.update(NodeStatus::Running).await.unwrap();

    let eviction_config = EvictionConfig { required_cluster_size: 3, health_check_timeout: Duration::from_secs(30) };
    let eviction = Arc::new(EvictionController::new(
        eviction_config,
        self_gossip.clone(),
        engine.clone() as Arc<dyn KvEngine>,
        "http://self.peer",
    ));
    eviction.start(ctx.clone()).await.unwrap();

    let quorum_established = wait_until_async(Duration::from_secs(5), Duration::from_millis(50), || async {
        eviction.health_check().await == HealthStatus::Healthy
    })
    .await;
    assert!(quorum_established, "eviction controller never observed quorum");

    // An impostor claims the same PeerURL as "original" under a new name.
    let impostor = gossip_node_with_peer_url("impostor", "http://dup.peer", impostor_addr, vec![self_addr]).await;
    impostor.start(ctx.clone()).await.unwrap();
    impostor.update(NodeStatus::Running).await.unwrap();

    let evicted = wait_until(Duration::from_secs(5), Duration::from_millis(50), || engine.was_removed("original")).await;
    assert!(evicted, "duplicate PeerURL join did not evict the stale member in time");

    ctx.cancel();
}

#[tokio::test]
async fn silent_follower_is_evicted_after_grace_period_under_quorum() {
    let self_addr = free_udp_addr().await;
    let peer_addr = free_udp_addr().await;
    let third_addr = free_udp_addr().await;

    let engine = Arc::new(FakeEngine::new());
    engine
        .start(
            &[
                PeerSpec { name: "self".into(), peer_url: "http://self.peer".into() },
                PeerSpec { name: "peer".into(), peer_url: "http://peer.peer".into() },
                PeerSpec { name: "third".into(), peer_url: "http://third.peer".into() },
            ],
            StartMode::NewCluster,
        )
        .await
        .unwrap();

    let ctx = CancellationToken::new();

    let self_gossip = gossip_node("self", self_addr, vec![]).await;
    self_gossip.start(ctx.clone()).await.unwrap();
    self_gossip.update(NodeStatus::Running).await.unwrap();

    let peer_gossip = gossip_node("peer", peer_addr, vec![self_addr]).await;
    peer_gossip.start(ctx.clone()).await.unwrap();
    peer_gossip.update(NodeStatus::Running).await.unwrap();

    let third_gossip = gossip_node("third", third_addr, vec![self_addr]).await;
    third_gossip.start(ctx.clone()).await.unwrap();
    third_gossip.update(NodeStatus::Running).await.unwrap();

    let eviction_config = EvictionConfig { required_cluster_size: 3, health_check_timeout: Duration::from_millis(200) };
    let eviction = Arc::new(EvictionController::new(
        eviction_config,
        self_gossip.clone(),
        engine.clone() as Arc<dyn KvEngine>,
        "http://self.peer",
    ));
    eviction.start(ctx.clone()).await.unwrap();

    // Wait for all three to see each other as Running before taking "peer" silent.
    let converged = wait_until_async(Duration::from_secs(5), Duration::from_millis(50), || async {
        self_gossip.running_members().await.len() >= 3
    })
    .await;
    assert!(converged, "gossip did not converge on three running members in time");

    peer_gossip.shutdown().await.unwrap();

    let evicted = wait_until(Duration::from_secs(5), Duration::from_millis(50), || engine.was_removed("peer")).await;
    assert!(evicted, "silent follower was not evicted once quorum's grace period elapsed");

    ctx.cancel();
}

#[tokio::test]
async fn snapshot_round_trip_through_restore() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new());
    engine.put(b"key", b"value").await.unwrap();

    let pipeline = SnapshotPipeline::new(
        SnapshotConfig {
            interval: Duration::from_secs(3600),
            compression: true,
            encryption_key: None,
            store: Arc::new(FileBlobStore::new(dir.path().join("snap.db"))),
        },
        engine.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    pipeline.tick().await.unwrap();

    let fresh_engine = Arc::new(FakeEngine::new());
    let restore_pipeline = SnapshotPipeline::new(
        SnapshotConfig {
            interval: Duration::from_secs(3600),
            compression: true,
            encryption_key: None,
            store: Arc::new(FileBlobStore::new(dir.path().join("snap.db"))),
        },
        fresh_engine.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    let peers = [PeerSpec { name: "restored".into(), peer_url: "http://restored".into() }];
    restore_pipeline.restore(&peers).await.unwrap();

    assert_eq!(fresh_engine.get(b"key").await.unwrap(), Some(b"value".to_vec()));
    assert!(fresh_engine.is_ready().await);
}

#[tokio::test]
async fn tampered_encrypted_snapshot_is_rejected_on_restore() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("snap.db");
    let key = [7u8; shared_crypto::KEY_LEN];

    let engine = Arc::new(FakeEngine::new());
    engine.put(b"key", b"value").await.unwrap();
    let pipeline = SnapshotPipeline::new(
        SnapshotConfig { interval: Duration::from_secs(3600), compression: false, encryption_key: Some(key), store: Arc::new(FileBlobStore::new(store_path.clone())) },
        engine.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    pipeline.tick().await.unwrap();

    let mut bytes = tokio::fs::read(&store_path).await.unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    tokio::fs::write(&store_path, &bytes).await.unwrap();

    let restore_engine = Arc::new(FakeEngine::new());
    let restore_pipeline = SnapshotPipeline::new(
        SnapshotConfig { interval: Duration::from_secs(3600), compression: false, encryption_key: Some(key), store: Arc::new(FileBlobStore::new(store_path)) },
        restore_engine,
        Arc::new(AtomicBool::new(false)),
    );
    let peers = [PeerSpec { name: "restored".into(), peer_url: "http://restored".into() }];
    let err = restore_pipeline.restore(&peers).await.unwrap_err();
    assert!(matches!(err, kvsupervisor::CoreError::Auth(_)));
}
