#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::gossip::{
    GossipConfig, GossipEngine, GossipHandle, GossipWatcher, Gossiper, Syncer,
};
use tether_core::netmap::{NetworkMap, Node, NodeStatus};

fn test_config() -> GossipConfig {
    GossipConfig {
        probe_interval: Duration::from_millis(75),
        ack_timeout: Duration::from_millis(50),
        suspicion_timeout: Duration::from_millis(300),
        expiry_timeout: Duration::from_millis(800),
        ..GossipConfig::default()
    }
}

struct TestNode {
    netmap: Arc<NetworkMap>,
    // The engine holds the syncer as its watcher; kept here for clarity.
    _syncer: Arc<Syncer>,
    engine: Arc<GossipEngine>,
    handle: GossipHandle,
}

impl TestNode {
    fn gossip_addr(&self) -> SocketAddr {
        self.engine.local_peer().gossip_addr
    }

    async fn join(&self, other: &Self) {
        self.engine.join(&[other.gossip_addr()]).await;
    }
}

async fn start_node(idx: u16) -> TestNode {
    let netmap = Arc::new(NetworkMap::new(Node::new(
        format!("node-{idx}"),
        format!("10.26.104.{idx}:8000"),
        format!("10.26.104.{idx}:8001"),
    )));
    let syncer = Arc::new(Syncer::new(Arc::clone(&netmap)));
    let (engine, handle) = GossipEngine::spawn(
        format!("node-{idx}"),
        "127.0.0.1:0".parse().expect("loopback addr"),
        None,
        test_config(),
        Arc::clone(&syncer) as Arc<dyn GossipWatcher>,
    )
    .await
    .expect("spawn engine");
    syncer.sync(Arc::clone(&engine) as Arc<dyn Gossiper>);
    TestNode {
        netmap,
        _syncer: syncer,
        engine,
        handle,
    }
}

async fn wait_for(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn endpoints_propagate_across_the_cluster() {
    let a = start_node(1).await;
    let b = start_node(2).await;

    a.netmap.add_local_endpoint("my-endpoint");
    a.netmap.add_local_endpoint("my-endpoint");
    b.join(&a).await;

    wait_for("endpoint visible on peer", Duration::from_secs(5), || {
        b.netmap
            .lookup_endpoint("my-endpoint")
            .iter()
            .any(|node| node.id == "node-1" && node.endpoints.get("my-endpoint") == Some(&2))
    })
    .await;

    let remote = b.netmap.node("node-1").expect("node-1 visible");
    assert_eq!(remote.status, NodeStatus::Active);
    assert_eq!(remote.proxy_addr, "10.26.104.1:8000");
    assert_eq!(remote.admin_addr, "10.26.104.1:8001");

    a.netmap.remove_local_endpoint("my-endpoint");
    a.netmap.remove_local_endpoint("my-endpoint");
    wait_for("endpoint removal propagated", Duration::from_secs(5), || {
        b.netmap.lookup_endpoint("my-endpoint").is_empty()
    })
    .await;

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_learn_of_each_other_transitively() {
    let a = start_node(3).await;
    let b = start_node(4).await;
    let c = start_node(5).await;

    // b and c only know a; they must discover each other through rumors.
    b.join(&a).await;
    c.join(&a).await;

    wait_for("full mesh", Duration::from_secs(5), || {
        b.netmap.node("node-5").is_some() && c.netmap.node("node-4").is_some()
    })
    .await;

    for handle in [a.handle, b.handle, c.handle] {
        handle.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn failed_node_is_marked_down_then_expired() {
    let a = start_node(6).await;
    let b = start_node(7).await;
    b.join(&a).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        a.netmap.node("node-7").is_some() && b.netmap.node("node-6").is_some()
    })
    .await;

    // Stop b without a leave announcement; a's failure detector must notice.
    b.handle.shutdown().await;

    wait_for("peer marked down", Duration::from_secs(5), || {
        a.netmap
            .node("node-7")
            .is_some_and(|node| node.status == NodeStatus::Down)
    })
    .await;

    wait_for("peer expired", Duration::from_secs(5), || {
        a.netmap.node("node-7").is_none()
    })
    .await;

    a.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leaving_node_is_marked_left() {
    let a = start_node(8).await;
    let b = start_node(9).await;
    b.join(&a).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        a.netmap.node("node-9").is_some() && b.netmap.node("node-8").is_some()
    })
    .await;

    // The bootstrapper's shutdown sequence: advertise the departure, announce
    // it to the cluster, then stop gossiping.
    b.netmap.set_local_status(NodeStatus::Left);
    b.engine.leave().await;
    b.handle.shutdown().await;

    wait_for("peer marked left", Duration::from_secs(5), || {
        a.netmap
            .node("node-9")
            .is_some_and(|node| node.status == NodeStatus::Left)
    })
    .await;

    a.handle.shutdown().await;
}
