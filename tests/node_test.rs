//! In-process multi-node integration tests: pairing, discovery, streaming,
//! overflow and lifecycle.

use chaski::net::{Node, NodeConfig};
use chaski::proxy::ProxyHandler;
use chaski::types::NodeClass;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

fn config(class: NodeClass, subs: &[&str]) -> NodeConfig {
    NodeConfig {
        class,
        subscriptions: subs.iter().map(|s| s.to_string()).collect(),
        // Fast timers so the suites finish quickly.
        discovery_interval: Duration::from_millis(300),
        latency_update: Duration::from_millis(500),
        keepalive_timeout: Duration::from_secs(2),
        reconnections: Some(2),
        ..Default::default()
    }
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn two_node_pair_and_push() {
    let root = Node::start(config(NodeClass::Streamer, &["topic1"]))
        .await
        .unwrap();
    let peer = Node::start(config(NodeClass::Streamer, &["topic1"]))
        .await
        .unwrap();

    peer.connect(&format!("*{}", root.address())).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            root.is_paired("topic1", peer.address()) && peer.is_paired("topic1", root.address())
        })
        .await,
        "both edges should pair on topic1 within 2s"
    );

    peer.push("topic1", br#"{"k":1}"#).await.unwrap();
    let msg = timeout(Duration::from_secs(2), root.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, br#"{"k":1}"#.to_vec());
    assert_eq!(msg.topic, "topic1");
    assert_eq!(&msg.source, peer.address());

    root.push("topic1", br#"{"k":2}"#).await.unwrap();
    let msg = timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, br#"{"k":2}"#.to_vec());

    // Keepalive probes run on the fast test cadence; RTT shows up soon.
    assert!(
        wait_until(Duration::from_secs(3), || {
            peer.latency_ms(root.address()).is_some()
        })
        .await
    );

    root.stop();
    peer.stop();
}

#[tokio::test]
async fn discovery_pairs_through_intermediary() {
    let r = Node::start(config(NodeClass::Streamer, &["a", "b"]))
        .await
        .unwrap();
    let m = Node::start(config(NodeClass::Streamer, &["a"])).await.unwrap();
    let n = Node::start(config(NodeClass::Streamer, &["b"])).await.unwrap();

    m.connect(&r.address().to_string()).await.unwrap();
    n.connect(&m.address().to_string()).await.unwrap();

    // N and R share no edge at first; discovery must pair them on "b".
    assert!(
        wait_until(Duration::from_secs(5), || {
            n.is_paired("b", r.address()) && r.is_paired("b", n.address())
        })
        .await,
        "N and R should pair on 'b' through M"
    );
    assert!(n.edge_addresses().contains(r.address()));

    // M and R overlap on "a".
    assert!(
        wait_until(Duration::from_secs(5), || {
            m.is_paired("a", r.address()) && r.is_paired("a", m.address())
        })
        .await
    );

    // Streaming follows the discovered pairing.
    n.push("b", b"via discovery").await.unwrap();
    let msg = timeout(Duration::from_secs(2), r.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.topic, "b");
    assert_eq!(msg.payload, b"via discovery".to_vec());

    r.stop();
    m.stop();
    n.stop();
}

#[tokio::test]
async fn ring_discovery_is_loop_free_and_stable() {
    let a = Node::start(config(NodeClass::Streamer, &["t"])).await.unwrap();
    let b = Node::start(config(NodeClass::Streamer, &["t"])).await.unwrap();
    let c = Node::start(config(NodeClass::Streamer, &["t"])).await.unwrap();

    b.connect(&a.address().to_string()).await.unwrap();
    c.connect(&b.address().to_string()).await.unwrap();
    a.connect(&c.address().to_string()).await.unwrap();

    // Everyone ends up paired with someone on "t".
    assert!(
        wait_until(Duration::from_secs(6), || {
            !a.paired_peers("t").is_empty()
                && !b.paired_peers("t").is_empty()
                && !c.paired_peers("t").is_empty()
        })
        .await,
        "ring should converge to pairings on 't'"
    );

    // Pairings are symmetric.
    for (node, peers) in [
        (&a, a.paired_peers("t")),
        (&b, b.paired_peers("t")),
        (&c, c.paired_peers("t")),
    ] {
        for peer in peers {
            let other = [&a, &b, &c]
                .into_iter()
                .find(|n| n.address() == &peer)
                .expect("pair peer is one of the ring nodes");
            assert!(
                other.is_paired("t", node.address()),
                "{} and {} should agree on the pairing",
                node.address(),
                peer
            );
        }
    }

    // Exclusivity: further discovery rounds do not change established state.
    let snapshot = |n: &Arc<Node>| {
        let mut peers = n.paired_peers("t");
        peers.sort_by_key(|p| p.to_string());
        peers
    };
    let before = (snapshot(&a), snapshot(&b), snapshot(&c));
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(before, (snapshot(&a), snapshot(&b), snapshot(&c)));

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test]
async fn zero_ttl_discovery_does_not_cross_a_relay() {
    // A emits with ttl 0; the relay must not forward it.
    let mut a_cfg = config(NodeClass::Streamer, &["t"]);
    a_cfg.discovery_ttl = 0;
    // The far node never initiates its own rounds.
    let mut far_cfg = config(NodeClass::Streamer, &["t"]);
    far_cfg.discovery_interval = Duration::from_secs(3600);

    let a = Node::start(a_cfg).await.unwrap();
    let relay = Node::start(config(NodeClass::Streamer, &[])).await.unwrap();
    let far = Node::start(far_cfg).await.unwrap();

    a.connect(&relay.address().to_string()).await.unwrap();
    far.connect(&relay.address().to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(a.paired_peers("t").is_empty());
    assert!(far.paired_peers("t").is_empty());

    a.stop();
    relay.stop();
    far.stop();
}

#[tokio::test]
async fn ttl_bounded_discovery_crosses_a_relay() {
    let mut a_cfg = config(NodeClass::Streamer, &["t"]);
    a_cfg.discovery_ttl = 2;
    let mut far_cfg = config(NodeClass::Streamer, &["t"]);
    far_cfg.discovery_interval = Duration::from_secs(3600);

    let a = Node::start(a_cfg).await.unwrap();
    let relay = Node::start(config(NodeClass::Streamer, &[])).await.unwrap();
    let far = Node::start(far_cfg).await.unwrap();

    a.connect(&relay.address().to_string()).await.unwrap();
    far.connect(&relay.address().to_string()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            a.is_paired("t", far.address()) && far.is_paired("t", a.address())
        })
        .await,
        "two hops are within ttl=2"
    );

    a.stop();
    relay.stop();
    far.stop();
}

#[tokio::test]
async fn no_duplicate_edges_per_address() {
    let a = Node::start(config(NodeClass::Node, &[])).await.unwrap();
    let b = Node::start(config(NodeClass::Node, &[])).await.unwrap();

    a.connect(&b.address().to_string()).await.unwrap();
    assert_eq!(a.edge_count(), 1);

    // A second connect to the same address reuses the edge.
    a.connect(&b.address().to_string()).await.unwrap();
    assert_eq!(a.edge_count(), 1);
    assert!(
        wait_until(Duration::from_secs(2), || b.edge_count() == 1).await,
        "B should hold exactly one edge to A"
    );

    a.stop();
    b.stop();
}

#[tokio::test]
async fn queue_overflow_is_lossy_not_fatal() {
    let mut consumer_cfg = config(NodeClass::Streamer, &["t"]);
    consumer_cfg.queue_capacity = 4;
    let consumer = Node::start(consumer_cfg).await.unwrap();
    let producer = Node::start(config(NodeClass::Streamer, &["t"]))
        .await
        .unwrap();

    producer
        .connect(&format!("*{}", consumer.address()))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            producer.is_paired("t", consumer.address())
        })
        .await
    );

    for n in 0u8..100 {
        producer.push("t", &[n]).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || consumer.queue_overflow() == 96).await,
        "overflow counter should reach 96, got {}",
        consumer.queue_overflow()
    );

    // Exactly the last four messages survive, in push order.
    for n in 96u8..100 {
        let msg = timeout(Duration::from_secs(1), consumer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, vec![n]);
    }
    assert_eq!(consumer.queue_len(), 0);

    // The node stayed healthy.
    producer.push("t", b"still alive").await.unwrap();
    let msg = timeout(Duration::from_secs(2), consumer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, b"still alive".to_vec());

    producer.stop();
    consumer.stop();
}

#[tokio::test]
async fn graceful_stop_closes_everything() {
    let a = Node::start(config(NodeClass::Node, &["t"])).await.unwrap();
    let b = Node::start(config(NodeClass::Node, &["t"])).await.unwrap();
    b.connect(&format!("*{}", a.address())).await.unwrap();

    let a_addr = a.address().clone();
    a.stop();

    assert_eq!(a.edge_count(), 0);
    assert!(a.recv().await.is_none());

    // A's listener is gone; B cannot dial it again.
    assert!(
        wait_until(Duration::from_secs(3), || {
            !b.edge_addresses().contains(&a_addr)
        })
        .await,
        "B should drop its edge to the stopped node"
    );

    // Push after stop reports the node as stopped.
    assert!(a.push("t", b"x").await.is_err());

    b.stop();
}

#[tokio::test]
async fn session_drop_stops_the_node() {
    let node = Node::start(config(NodeClass::Streamer, &["t"])).await.unwrap();
    {
        let _session = node.session();
    }
    assert!(node.is_stopped());
    assert!(node.recv().await.is_none());
}

struct Upper;

impl ProxyHandler for Upper {
    fn call(&self, _: &str, _: &str, args: &[u8], _: &[u8]) -> Result<Vec<u8>, String> {
        Ok(args.to_ascii_uppercase())
    }
}

#[tokio::test]
async fn proxy_call_round_trip_and_refusal() {
    let mut server_cfg = config(NodeClass::Remote, &[]);
    server_cfg.allowed_modules = vec!["demo.strings".to_string()];
    let server = Node::start_with(server_cfg, None, Some(Arc::new(Upper)))
        .await
        .unwrap();
    let client = Node::start(config(NodeClass::Node, &[])).await.unwrap();

    let server_addr = client.connect(&server.address().to_string()).await.unwrap();

    let out = client
        .proxy_call(&server_addr, "demo.strings", "upper", b"hola".to_vec(), vec![])
        .await
        .unwrap();
    assert_eq!(out, b"HOLA".to_vec());

    let err = client
        .proxy_call(&server_addr, "os.system", "run", vec![], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("refused"));

    server.stop();
    client.stop();
}
