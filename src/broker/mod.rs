//! MQTT Broker Core
//!
//! The main broker implementation that accepts client connections, routes
//! messages, and coordinates the session, subscription, retained/will and
//! retry components. A [`BrokerContext`] holds everything shared between
//! connection tasks, the retry timers and the cluster bridge.

mod connection;
mod writer;

#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionError};
pub use writer::ClientHandle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterBridge, ClusterError, ClusterTransport};
use crate::config::{local_node_id, DEFAULT_CLUSTER_CHANNEL};
use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::{Publish, QoS};
use crate::retry::{RetryKey, RetryScheduler};
use crate::session::SessionStore;
use crate::store::{MemoryStore, MessageStore, RetainedMessage};
use crate::topic::SubscriptionStore;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum connections
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Interval between retransmissions of unacknowledged packets
    pub retry_interval: Duration,
    /// Outbound queue capacity per connection
    pub outbound_channel_capacity: usize,
    /// Idle timeout floor; the effective timeout is max(this, 2 x keep alive)
    pub heartbeat_timeout: Duration,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// This node's id on the cluster bus
    pub node_id: String,
    /// Cluster bus channel
    pub cluster_channel: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            retry_interval: Duration::from_secs(5),
            outbound_channel_capacity: 1024,
            heartbeat_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            node_id: local_node_id(),
            cluster_channel: DEFAULT_CLUSTER_CHANNEL.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Idle timeout for a client announcing `keep_alive` seconds
    pub fn heartbeat_for(&self, keep_alive: u16) -> Duration {
        let requested = Duration::from_secs(keep_alive as u64 * 2);
        self.heartbeat_timeout.max(requested)
    }
}

/// Resolves once shutdown is requested or the broker is gone.
///
/// The borrowed flag is released before returning, so the caller's future
/// stays `Send` across later awaits.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Outcome of delivering one publish to the local subscribers of a topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FanOut {
    /// Distinct clients holding a matching subscription
    pub matched: usize,
    /// Clients the publish was queued for
    pub delivered: usize,
}

/// Where an inbound publish entered the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client connected to this node
    Local,
    /// Replayed from another node
    Cluster,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        identity: Arc<str>,
        client_id: Arc<str>,
        username: Option<String>,
        peer: SocketAddr,
    },
    /// Client disconnected
    ClientDisconnected { identity: Arc<str> },
    /// Subscription granted
    SubscriptionAdded {
        identity: Arc<str>,
        filter: String,
        qos: QoS,
    },
    /// Subscription removed
    SubscriptionRemoved { identity: Arc<str>, filter: String },
    /// A local client published a message
    MessagePublished {
        client_id: Arc<str>,
        username: Option<String>,
        publish: Publish,
        received_at: SystemTime,
    },
    /// Server-side publish, to one client or to all subscribers
    Downstream {
        client_id: Option<Arc<str>>,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
}

/// Broker error types
#[derive(Debug)]
pub enum BrokerError {
    /// Listener IO error
    Io(std::io::Error),
    /// Cluster transport error
    Cluster(ClusterError),
    /// start() called twice
    AlreadyRunning,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::Cluster(e) => write!(f, "Cluster error: {}", e),
            BrokerError::AlreadyRunning => write!(f, "Broker already running"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<ClusterError> for BrokerError {
    fn from(e: ClusterError) -> Self {
        BrokerError::Cluster(e)
    }
}

/// State shared by connections, retry timers and the cluster bridge
pub struct BrokerContext {
    pub(crate) config: BrokerConfig,
    pub(crate) sessions: SessionStore,
    pub(crate) subscriptions: SubscriptionStore,
    pub(crate) store: Arc<dyn MessageStore>,
    /// Live connections by identity
    pub(crate) connections: DashMap<Arc<str>, Arc<ClientHandle>>,
    pub(crate) retry: RetryScheduler,
    pub(crate) events: broadcast::Sender<BrokerEvent>,
    pub(crate) hooks: Arc<dyn Hooks>,
    next_connection_id: AtomicU64,
}

impl BrokerContext {
    fn new(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        store: Arc<dyn MessageStore>,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            retry: RetryScheduler::new(config.retry_interval),
            config,
            sessions: SessionStore::new(),
            subscriptions: SubscriptionStore::new(),
            store,
            connections: DashMap::new(),
            events,
            hooks,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.connections.contains_key(identity)
    }

    /// Send one publish to a connected client.
    ///
    /// QoS 1/2 publishes get a packet id, pending state and a retry timer
    /// before they are queued, so a full queue only delays delivery.
    pub(crate) fn deliver(&self, identity: &str, publish: Publish) -> bool {
        let Some(client) = self.connections.get(identity).map(|c| c.value().clone()) else {
            return false;
        };

        if publish.qos == QoS::AtMostOnce {
            return client.send(crate::protocol::Packet::Publish(publish));
        }

        let Some(session) = self.sessions.get(identity) else {
            debug!("No session for {}, dropping QoS {:?} publish", identity, publish.qos);
            return false;
        };

        let (packet_id, sent) = {
            let mut s = session.lock();
            if s.connection_id != client.connection_id() {
                return false;
            }
            let Some(outbound) = s.register_outbound(publish, self.config.retry_interval) else {
                warn!("No free packet id for {}, dropping publish", identity);
                return false;
            };
            let packet_id = outbound.packet_id.unwrap_or_default();
            (packet_id, client.send(crate::protocol::Packet::Publish(outbound)))
        };

        self.retry.schedule(
            RetryKey::outbound(client.client_id(), packet_id),
            session,
            client,
        );
        sent
    }

    /// Deliver to every local subscriber of the topic.
    ///
    /// A client matching several filters receives one copy at the highest
    /// matching subscription QoS.
    pub(crate) fn fan_out(&self, topic: &Arc<str>, payload: &Bytes, qos: QoS, retain: bool) -> FanOut {
        let matches = self.subscriptions.search(topic);
        if matches.is_empty() {
            return FanOut::default();
        }

        // Deduplicate by client_id (keep highest QoS)
        let mut client_qos: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(matches.len());
        for sub in matches {
            let entry = client_qos.entry(sub.client_id).or_insert(QoS::AtMostOnce);
            if sub.qos > *entry {
                *entry = sub.qos;
            }
        }

        let mut outcome = FanOut {
            matched: client_qos.len(),
            delivered: 0,
        };
        for (client_id, sub_qos) in client_qos {
            let publish = Publish {
                dup: false,
                qos: qos.min(sub_qos),
                retain,
                topic: topic.clone(),
                packet_id: None,
                payload: payload.clone(),
            };
            if self.deliver(&client_id, publish) {
                outcome.delivered += 1;
            }
        }
        outcome
    }

    /// Deliver to one client, once, at the highest QoS among its matching
    /// subscriptions
    pub(crate) fn publish_to(
        &self,
        identity: &str,
        topic: &Arc<str>,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
    ) -> bool {
        if !self.connections.contains_key(identity) {
            warn!("Publish to {} on {}: client not connected", identity, topic);
            return false;
        }
        let Some(sub_qos) = self
            .subscriptions
            .search_client(topic, identity)
            .iter()
            .map(|s| s.qos)
            .max()
        else {
            warn!("Publish to {} on {}: no matching subscription", identity, topic);
            return false;
        };

        self.deliver(
            identity,
            Publish {
                dup: false,
                qos: qos.min(sub_qos),
                retain,
                topic: topic.clone(),
                packet_id: None,
                payload: payload.clone(),
            },
        )
    }

    /// Inbound publish path: retained store, message listener, local
    /// fan-out and cluster relay.
    ///
    /// Cluster replays skip the listener and are not relayed again.
    pub(crate) async fn process_publish(
        &self,
        origin: Origin,
        client_id: &Arc<str>,
        username: Option<&str>,
        publish: Publish,
    ) {
        if publish.retain && self.config.retain_available {
            let result = if publish.qos == QoS::AtMostOnce && publish.payload.is_empty() {
                self.store.clear_retained(&publish.topic).await
            } else {
                self.store
                    .set_retained(RetainedMessage {
                        topic: publish.topic.to_string(),
                        payload: publish.payload.clone(),
                        qos: publish.qos,
                    })
                    .await
            };
            if let Err(e) = result {
                warn!("Failed to update retained message on {}: {}", publish.topic, e);
            }
        }

        if origin == Origin::Local {
            if let Err(e) = self
                .hooks
                .on_message(client_id, &publish.topic, publish.qos, &publish.payload)
                .await
            {
                warn!("Message listener failed for {} on {}: {}", client_id, publish.topic, e);
            }
        }

        let outcome = self.fan_out(&publish.topic, &publish.payload, publish.qos, false);
        debug!(
            "PUBLISH {} from {} ({:?}) reached {}/{} clients",
            publish.topic, client_id, origin, outcome.delivered, outcome.matched
        );

        if origin == Origin::Local {
            self.emit(BrokerEvent::MessagePublished {
                client_id: client_id.clone(),
                username: username.map(str::to_string),
                publish,
                received_at: SystemTime::now(),
            });
        }
    }

    /// Tear down identity state after a local takeover moved the binding
    /// to a new connection.
    ///
    /// The will is dropped, not delivered.
    pub(crate) async fn release_identity(&self, identity: &Arc<str>) {
        if let Err(e) = self.store.clear_will(identity).await {
            warn!("Failed to clear will for {}: {}", identity, e);
        }
        self.sessions.remove(identity);
        self.retry.cancel_all(identity);
        self.subscriptions.remove_all(identity);
        if let Err(e) = self.hooks.on_client_disconnected(identity).await {
            warn!("Offline listener failed for {}: {}", identity, e);
        }
        self.emit(BrokerEvent::ClientDisconnected {
            identity: identity.clone(),
        });
    }

    /// Close a local connection from outside without unbinding it.
    ///
    /// The connection runs its own close path, which delivers the will.
    /// Returns true if the identity was connected here.
    pub(crate) fn evict(&self, identity: &str, reason: &str) -> bool {
        let Some(client) = self.connections.get(identity).map(|c| c.value().clone()) else {
            return false;
        };
        info!("Closing {}: {}", identity, reason);
        client.close(reason);
        true
    }
}

/// The MQTT Broker
pub struct Broker {
    /// Shared state
    ctx: Arc<BrokerContext>,
    /// Cluster bus, if clustering is enabled
    cluster: Option<Arc<dyn ClusterTransport>>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
    /// Whether start() has run
    running: AtomicBool,
    /// Bound listener address
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything) and an
    /// in-memory message store
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(1024);

        Self {
            ctx: Arc::new(BrokerContext::new(
                config,
                Arc::new(DefaultHooks),
                Arc::new(MemoryStore::new()),
                events,
            )),
            cluster: None,
            shutdown,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Use custom hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        match Arc::get_mut(&mut self.ctx) {
            Some(ctx) => ctx.hooks = hooks,
            None => warn!("Broker already running, hooks ignored"),
        }
        self
    }

    /// Use a custom retained/will store
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        match Arc::get_mut(&mut self.ctx) {
            Some(ctx) => ctx.store = store,
            None => warn!("Broker already running, store ignored"),
        }
        self
    }

    /// Join a cluster over the given bus
    pub fn with_cluster(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.cluster = Some(transport);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, BrokerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrokerError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(self.ctx.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        self.shutdown.send_replace(false);

        if let Some(transport) = &self.cluster {
            let bridge = ClusterBridge::new(self.ctx.clone(), transport.clone());
            if let Err(e) = bridge.start(self.shutdown.subscribe()).await {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
            info!(
                "Cluster bridge joined {} as {}",
                self.ctx.config.cluster_channel, self.ctx.config.node_id
            );
        }

        info!("MQTT/TCP listening on {}", local_addr);
        *self.local_addr.lock() = Some(local_addr);

        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let conn_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            debug!("Starting TCP accept loop");
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            debug!("New TCP connection from {}", addr);
                            handle_connection(ctx.clone(), stream, addr, conn_shutdown.clone());
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    },
                    _ = shutdown_requested(&mut shutdown_rx) => {
                        debug!("Accept loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting connections and close every client.
    ///
    /// Returns false if the broker was not running.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        *self.local_addr.lock() = None;
        info!("Broker stopping");
        true
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.ctx.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.ctx.connections.len()
    }

    /// Check whether an identity is connected to this node
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.ctx.is_connected(client_id)
    }

    /// Publish a message from the server to one client.
    ///
    /// The client receives one copy at min(qos, its highest matching
    /// subscription QoS); the retain flag is passed through as given. The
    /// message is also relayed to the cluster. Returns whether the client
    /// was reached on this node.
    pub fn publish(
        &self,
        client_id: &str,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> bool {
        let client_id: Arc<str> = Arc::from(client_id);
        let topic: Arc<str> = Arc::from(topic);
        let delivered = self
            .ctx
            .publish_to(&client_id, &topic, &payload, qos, retain);
        self.ctx.emit(BrokerEvent::Downstream {
            client_id: Some(client_id),
            topic,
            payload,
            qos,
            retain,
        });
        delivered
    }

    /// Publish a message from the server to every subscriber.
    ///
    /// Returns whether any local client subscribes to the topic, even if
    /// its outbound queue was full. The message is also relayed to the
    /// cluster.
    pub fn publish_all(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> bool {
        let topic: Arc<str> = Arc::from(topic);
        let outcome = self.ctx.fan_out(&topic, &payload, qos, retain);
        if outcome.matched == 0 {
            warn!("publish_all on {}: no local subscribers", topic);
        }
        self.ctx.emit(BrokerEvent::Downstream {
            client_id: None,
            topic,
            payload,
            qos,
            retain,
        });
        outcome.matched > 0
    }

    /// Close a client's connection from the server side.
    ///
    /// This is not a clean disconnect: the client's will is delivered.
    pub fn disconnect(&self, client_id: &str) -> bool {
        self.ctx.evict(client_id, "disconnected by server")
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Spawn the task driving one accepted connection
fn handle_connection(
    ctx: Arc<BrokerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    tokio::spawn(async move {
        let mut conn = Connection::new(stream, addr, ctx, shutdown);
        if let Err(e) = conn.run().await {
            debug!("Connection error from {}: {}", addr, e);
        }
    });
}
