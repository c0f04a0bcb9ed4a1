use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use super::*;
use crate::protocol::Packet;

fn context(config: BrokerConfig) -> BrokerContext {
    let (events, _) = broadcast::channel(16);
    BrokerContext::new(
        config,
        Arc::new(DefaultHooks),
        Arc::new(MemoryStore::new()),
        events,
    )
}

fn bind(
    ctx: &BrokerContext,
    identity: &str,
    capacity: usize,
) -> (Arc<ClientHandle>, tokio::sync::mpsc::Receiver<Packet>) {
    let identity: Arc<str> = Arc::from(identity);
    let (handle, rx) = ClientHandle::new(ctx.next_connection_id(), identity.clone(), capacity);
    let handle = Arc::new(handle);
    ctx.connections.insert(identity, handle.clone());
    (handle, rx)
}

#[test]
fn test_heartbeat_for() {
    let config = BrokerConfig {
        heartbeat_timeout: Duration::from_secs(120),
        ..Default::default()
    };
    // keepAlive 0 falls back to the server default
    assert_eq!(config.heartbeat_for(0), Duration::from_secs(120));
    assert_eq!(config.heartbeat_for(30), Duration::from_secs(120));
    assert_eq!(config.heartbeat_for(60), Duration::from_secs(120));
    assert_eq!(config.heartbeat_for(90), Duration::from_secs(180));
    assert_eq!(
        config.heartbeat_for(u16::MAX),
        Duration::from_secs(2 * u16::MAX as u64)
    );
}

#[test]
fn test_fan_out_counts_matched_and_delivered() {
    let ctx = context(BrokerConfig::default());
    let (_fast, mut fast_rx) = bind(&ctx, "fast", 8);
    let (_full, _full_rx) = bind(&ctx, "full", 1);

    let fast: Arc<str> = Arc::from("fast");
    let full: Arc<str> = Arc::from("full");
    ctx.subscriptions.add("alerts/#", &fast, QoS::AtMostOnce);
    ctx.subscriptions.add("alerts/+", &fast, QoS::AtMostOnce);
    ctx.subscriptions.add("alerts/#", &full, QoS::AtMostOnce);

    let topic: Arc<str> = Arc::from("alerts/fire");
    let payload = Bytes::from_static(b"1");
    assert_eq!(
        ctx.fan_out(&topic, &payload, QoS::AtMostOnce, false),
        FanOut {
            matched: 2,
            delivered: 2
        }
    );

    // The second queue is now full; it still counts as a subscriber
    assert_eq!(
        ctx.fan_out(&topic, &payload, QoS::AtMostOnce, false),
        FanOut {
            matched: 2,
            delivered: 1
        }
    );
    assert!(matches!(fast_rx.try_recv(), Ok(Packet::Publish(_))));
    assert!(matches!(fast_rx.try_recv(), Ok(Packet::Publish(_))));
    assert!(fast_rx.try_recv().is_err());

    let nobody: Arc<str> = Arc::from("quiet/t");
    assert_eq!(
        ctx.fan_out(&nobody, &payload, QoS::AtMostOnce, false),
        FanOut::default()
    );
}

#[test]
fn test_evict_closes_without_unbinding() {
    let ctx = context(BrokerConfig::default());
    let (handle, _rx) = bind(&ctx, "roaming", 4);

    assert!(ctx.evict("roaming", "rebound on another node"));
    assert!(!handle.is_alive());
    assert_eq!(
        handle.close_reason().as_deref(),
        Some("rebound on another node")
    );
    // The connection task releases the binding on its own close path
    assert!(ctx.is_connected("roaming"));

    assert!(!ctx.evict("absent", "rebound on another node"));
}

#[tokio::test]
async fn test_shutdown_requested() {
    let (tx, mut rx) = watch::channel(false);
    let waiter = tokio::spawn(async move {
        shutdown_requested(&mut rx).await;
    });
    tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("shutdown not observed")
        .expect("waiter panicked");

    // A dropped sender also ends the wait
    let (tx, mut rx) = watch::channel(false);
    drop(tx);
    shutdown_requested(&mut rx).await;
}
