//! Cluster Tests
//!
//! Two brokers in one process share a [`MemoryBus`] and must behave like a
//! single broker to their clients.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use common::{start_broker, test_config, TestClient};
use tidemq::broker::{Broker, BrokerConfig};
use tidemq::cluster::{ClusterTransport, MemoryBus};
use tidemq::protocol::{ConnectReturnCode, Packet, PubAck, QoS, Will};

const QUIET: Duration = Duration::from_millis(300);

fn node_config(node_id: &str) -> BrokerConfig {
    BrokerConfig {
        node_id: node_id.to_string(),
        cluster_channel: "tidemq:test".to_string(),
        ..test_config()
    }
}

async fn start_node(node_id: &str, bus: &Arc<MemoryBus>) -> (Broker, std::net::SocketAddr) {
    let transport: Arc<dyn ClusterTransport> = bus.clone();
    let broker = Broker::new(node_config(node_id)).with_cluster(transport);
    let addr = broker.start().await.expect("Failed to start node");
    (broker, addr)
}

/// Give the bus tasks time to relay
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_publish_crosses_nodes_once() {
    let bus = Arc::new(MemoryBus::new());
    let (_a, addr_a) = start_node("node-a", &bus).await;
    let (_b, addr_b) = start_node("node-b", &bus).await;

    let mut sub_b = TestClient::connect(addr_b).await;
    sub_b.mqtt_connect("sub-b").await;
    sub_b.subscribe(1, "sensors/+", QoS::AtLeastOnce).await;

    let mut sub_a = TestClient::connect(addr_a).await;
    sub_a.mqtt_connect("sub-a").await;
    sub_a.subscribe(1, "sensors/+", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr_a).await;
    publisher.mqtt_connect("pub-a").await;
    publisher
        .publish("sensors/1", b"42", QoS::AtLeastOnce, Some(1), false)
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(PubAck::new(1))));

    // Remote subscriber gets exactly one copy
    let msg = sub_b.expect_publish().await;
    assert_eq!(&*msg.topic, "sensors/1");
    assert_eq!(&msg.payload[..], b"42");
    assert_eq!(msg.qos, QoS::AtLeastOnce);
    sub_b
        .send(&Packet::PubAck(PubAck::new(msg.packet_id.unwrap_or_default())))
        .await;

    // Local subscriber gets exactly one copy; node A ignores its own frame
    let local = sub_a.expect_publish().await;
    assert_eq!(&local.payload[..], b"42");

    sub_a.expect_nothing(QUIET).await;
    sub_b.expect_nothing(QUIET).await;
}

#[tokio::test]
async fn test_retained_replicated() {
    let bus = Arc::new(MemoryBus::new());
    let (_a, addr_a) = start_node("node-a", &bus).await;
    let (_b, addr_b) = start_node("node-b", &bus).await;

    let mut publisher = TestClient::connect(addr_a).await;
    publisher.mqtt_connect("pub-a").await;
    publisher
        .publish("config/mode", b"eco", QoS::AtMostOnce, None, true)
        .await;
    publisher.ping().await;
    settle().await;

    let mut late = TestClient::connect(addr_b).await;
    late.mqtt_connect("late-b").await;
    late.subscribe(1, "config/#", QoS::AtMostOnce).await;
    let msg = late.expect_publish().await;
    assert!(msg.retain);
    assert_eq!(&msg.payload[..], b"eco");
}

#[tokio::test]
async fn test_connect_on_other_node_evicts() {
    let bus = Arc::new(MemoryBus::new());
    let (a, addr_a) = start_node("node-a", &bus).await;
    let (b, addr_b) = start_node("node-b", &bus).await;

    let mut first = TestClient::connect(addr_a).await;
    first.mqtt_connect("roaming").await;
    assert!(a.is_connected("roaming"));

    let mut second = TestClient::connect(addr_b).await;
    assert_eq!(
        second.mqtt_connect("roaming").await.return_code,
        ConnectReturnCode::Accepted
    );

    assert!(first.is_closed().await);
    settle().await;
    assert!(!a.is_connected("roaming"));
    assert_eq!(a.session_count(), 0);
    assert!(b.is_connected("roaming"));
}

#[tokio::test]
async fn test_eviction_by_other_node_publishes_will() {
    let bus = Arc::new(MemoryBus::new());
    let (a, addr_a) = start_node("node-a", &bus).await;
    let (_b, addr_b) = start_node("node-b", &bus).await;

    let mut watcher = TestClient::connect(addr_b).await;
    watcher.mqtt_connect("watcher").await;
    watcher.subscribe(1, "fleet/+/status", QoS::AtMostOnce).await;

    let mut first = TestClient::connect(addr_a).await;
    first
        .mqtt_connect_with_will(
            "truck-9",
            Will {
                topic: "fleet/truck-9/status".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            },
        )
        .await;
    settle().await;

    let mut second = TestClient::connect(addr_b).await;
    second.mqtt_connect("truck-9").await;
    assert!(first.is_closed().await);

    // Node A delivers the will and relays it, once
    let msg = watcher.expect_publish().await;
    assert_eq!(&*msg.topic, "fleet/truck-9/status");
    assert_eq!(&msg.payload[..], b"offline");
    watcher.expect_nothing(QUIET).await;
    assert!(!a.is_connected("truck-9"));
}

#[tokio::test]
async fn test_server_publish_reaches_remote_client() {
    let bus = Arc::new(MemoryBus::new());
    let (a, _addr_a) = start_node("node-a", &bus).await;
    let (_b, addr_b) = start_node("node-b", &bus).await;

    let mut client = TestClient::connect(addr_b).await;
    client.mqtt_connect("remote-client").await;
    client.subscribe(1, "cmd/#", QoS::AtMostOnce).await;

    // Not connected on A, delivered through B
    assert!(!a.publish(
        "remote-client",
        "cmd/reboot",
        Bytes::from_static(b"now"),
        QoS::AtMostOnce,
        false
    ));
    let msg = client.expect_publish().await;
    assert_eq!(&*msg.topic, "cmd/reboot");

    a.publish_all("cmd/all", Bytes::from_static(b"hi"), QoS::AtMostOnce, false);
    let msg = client.expect_publish().await;
    assert_eq!(&*msg.topic, "cmd/all");
    client.expect_nothing(QUIET).await;
}

#[tokio::test]
async fn test_standalone_broker_has_no_bus() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("solo").await;
    assert_eq!(broker.connection_count(), 1);
}
