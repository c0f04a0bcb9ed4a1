//! Cluster Module
//!
//! Relays broker events between nodes over a shared pub/sub bus.
//!
//! # Architecture
//!
//! Every node publishes frames describing its local activity (client
//! connects, subscription changes, client publishes, server publishes) on
//! one channel and subscribes to the same channel. Frames from other nodes
//! are replayed into the local broker; frames a node sent itself are
//! ignored.
//!
//! The bus is pluggable through [`ClusterTransport`]. [`MemoryBus`] runs
//! several nodes inside one process.
//!
//! ```toml
//! # tidemq.toml
//! [cluster]
//! enabled = true
//! node_id = "node-1"
//! channel = "tidemq:cluster"
//! ```

mod protocol;

pub use protocol::{ClusterEvent, ClusterKind};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use crate::broker::{shutdown_requested, BrokerContext, BrokerEvent, Origin};
use crate::protocol::Publish;

// Re-export cluster config
pub use crate::config::ClusterConfig;

/// Cluster error types
#[derive(Debug)]
pub enum ClusterError {
    /// Frame could not be encoded or decoded
    Malformed(&'static str),
    /// Bus failure
    Transport(String),
    /// Bus already shut down
    Closed,
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::Malformed(reason) => write!(f, "Malformed cluster frame: {}", reason),
            ClusterError::Transport(e) => write!(f, "Cluster transport error: {}", e),
            ClusterError::Closed => write!(f, "Cluster transport closed"),
        }
    }
}

impl std::error::Error for ClusterError {}

/// Callback receiving raw frames from the bus
pub type ClusterCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A pub/sub bus shared by all nodes
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Publish one frame to every subscriber of `channel`
    async fn publish(&self, channel: &str, frame: Bytes) -> Result<(), ClusterError>;

    /// Call `callback` for every frame published on `channel` from now on
    async fn subscribe(&self, channel: &str, callback: ClusterCallback) -> Result<(), ClusterError>;
}

/// In-process bus built on broadcast channels
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Frames buffered per subscriber before slow subscribers start losing them
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterTransport for MemoryBus {
    async fn publish(&self, channel: &str, frame: Bytes) -> Result<(), ClusterError> {
        // No subscribers is fine
        let _ = self.sender(channel).send(frame);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, callback: ClusterCallback) -> Result<(), ClusterError> {
        let mut rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => callback(frame),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Memory bus subscriber on {} lagged, {} frames lost", channel, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }
}

/// Connects one broker to the cluster bus
pub struct ClusterBridge {
    ctx: Arc<BrokerContext>,
    transport: Arc<dyn ClusterTransport>,
}

impl ClusterBridge {
    pub fn new(ctx: Arc<BrokerContext>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self { ctx, transport }
    }

    /// Subscribe to the bus and spawn the inbound and outbound tasks.
    ///
    /// Both tasks stop when `shutdown` turns true.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<(), ClusterError> {
        let channel = self.ctx.config.cluster_channel.clone();

        // Subscribe to broker events before anything can be missed
        let events = self.ctx.events.subscribe();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Bytes>();
        let callback: ClusterCallback = Arc::new(move |frame| {
            // Receiver gone means the bridge stopped
            let _ = frame_tx.send(frame);
        });
        self.transport.subscribe(&channel, callback).await?;

        tokio::spawn(run_inbound(self.ctx.clone(), frame_rx, shutdown.clone()));
        tokio::spawn(run_outbound(
            self.ctx.clone(),
            self.transport.clone(),
            channel,
            events,
            shutdown,
        ));
        Ok(())
    }
}

/// Replay frames from other nodes into the local broker
async fn run_inbound(
    ctx: Arc<BrokerContext>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => match ClusterEvent::decode(&frame) {
                    Ok(event) => apply_remote(&ctx, event).await,
                    Err(e) => warn!("Dropping cluster frame: {}", e),
                },
                None => break,
            },
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
    debug!("Cluster inbound task stopped");
}

/// Apply one remote event to local state
async fn apply_remote(ctx: &BrokerContext, event: ClusterEvent) {
    if event.node == ctx.config.node_id {
        trace!("Ignoring own {} frame", event.kind.name());
        return;
    }
    trace!("Cluster {} from {}", event.kind.name(), event.node);

    match event.kind {
        ClusterKind::Connect => {
            if let Some(client_id) = event.client_id.as_deref() {
                ctx.evict(client_id, "rebound on another node");
            }
        }
        ClusterKind::Subscribe => {
            let (Some(client_id), Some(filter)) = (event.client_id, event.topic) else {
                warn!("Cluster SUBSCRIBE from {} without client or filter", event.node);
                return;
            };
            if ctx.is_connected(&client_id) {
                let identity: Arc<str> = Arc::from(client_id);
                ctx.subscriptions.add(&filter, &identity, event.qos);
            }
        }
        ClusterKind::Unsubscribe => {
            let (Some(client_id), Some(filter)) = (event.client_id, event.topic) else {
                warn!("Cluster UNSUBSCRIBE from {} without client or filter", event.node);
                return;
            };
            if ctx.is_connected(&client_id) {
                ctx.subscriptions.remove(&filter, &client_id);
            }
        }
        ClusterKind::UpStream => {
            let Some(topic) = event.topic else {
                warn!("Cluster UP_STREAM from {} without topic", event.node);
                return;
            };
            let from: Arc<str> = Arc::from(event.from_client_id.unwrap_or_default());
            let publish = Publish {
                dup: false,
                qos: event.qos,
                retain: event.retain,
                topic: Arc::from(topic),
                packet_id: None,
                payload: event.payload,
            };
            ctx.process_publish(Origin::Cluster, &from, event.from_username.as_deref(), publish)
                .await;
        }
        ClusterKind::DownStream => {
            let Some(topic) = event.topic else {
                warn!("Cluster DOWN_STREAM from {} without topic", event.node);
                return;
            };
            let topic: Arc<str> = Arc::from(topic);
            match event.client_id.as_deref() {
                Some(client_id) => {
                    if ctx.is_connected(client_id) {
                        ctx.publish_to(client_id, &topic, &event.payload, event.qos, event.retain);
                    }
                }
                None => {
                    ctx.fan_out(&topic, &event.payload, event.qos, event.retain);
                }
            }
        }
    }
}

/// Publish local broker events on the bus
async fn run_outbound(
    ctx: Arc<BrokerContext>,
    transport: Arc<dyn ClusterTransport>,
    channel: String,
    mut events: broadcast::Receiver<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let node_id = ctx.config.node_id.clone();
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Cluster bridge lagged, {} events not relayed", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_requested(&mut shutdown) => break,
        };

        let Some(frame) = to_cluster_event(&node_id, event) else {
            continue;
        };
        let kind = frame.kind;
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode cluster {}: {}", kind.name(), e);
                continue;
            }
        };
        if let Err(e) = transport.publish(&channel, bytes).await {
            warn!("Cluster publish of {} failed: {}", kind.name(), e);
        }
    }
    debug!("Cluster outbound task stopped");
}

/// Frame for a broker event; None for events that stay local
fn to_cluster_event(node_id: &str, event: BrokerEvent) -> Option<ClusterEvent> {
    let event = match event {
        BrokerEvent::ClientConnected {
            identity,
            username,
            peer,
            ..
        } => ClusterEvent {
            client_id: Some(identity.to_string()),
            username,
            peer_host: Some(peer.ip().to_string()),
            ..ClusterEvent::new(ClusterKind::Connect, node_id)
        },
        BrokerEvent::SubscriptionAdded {
            identity,
            filter,
            qos,
        } => ClusterEvent {
            client_id: Some(identity.to_string()),
            topic: Some(filter),
            qos,
            ..ClusterEvent::new(ClusterKind::Subscribe, node_id)
        },
        BrokerEvent::SubscriptionRemoved { identity, filter } => ClusterEvent {
            client_id: Some(identity.to_string()),
            topic: Some(filter),
            ..ClusterEvent::new(ClusterKind::Unsubscribe, node_id)
        },
        BrokerEvent::MessagePublished {
            client_id,
            username,
            publish,
            received_at,
        } => ClusterEvent {
            message_id: publish.packet_id,
            from_client_id: Some(client_id.to_string()),
            from_username: username,
            topic: Some(publish.topic.to_string()),
            dup: publish.dup,
            qos: publish.qos,
            retain: publish.retain,
            payload: publish.payload,
            publish_received_at: Some(epoch_millis(received_at)),
            ..ClusterEvent::new(ClusterKind::UpStream, node_id)
        },
        BrokerEvent::Downstream {
            client_id,
            topic,
            payload,
            qos,
            retain,
        } => ClusterEvent {
            client_id: client_id.map(|c| c.to_string()),
            topic: Some(topic.to_string()),
            qos,
            retain,
            payload,
            ..ClusterEvent::new(ClusterKind::DownStream, node_id)
        },
        BrokerEvent::ClientDisconnected { .. } => return None,
    };

    Some(ClusterEvent {
        timestamp: epoch_millis(SystemTime::now()),
        ..event
    })
}

fn epoch_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
