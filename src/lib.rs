//! TideMQ - MQTT v3.1/v3.1.1 broker engine
//!
//! A protocol engine built from a byte-exact codec, a per-connection
//! dispatcher, concurrent session/subscription/retained stores, a QoS
//! retry scheduler and an optional cluster bridge relaying events between
//! broker processes over a shared bus.

pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod store;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent};
pub use cluster::{ClusterBridge, ClusterError, ClusterTransport, MemoryBus};
pub use config::{Config, LogConfig};
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use protocol::{ProtocolVersion, QoS};
pub use store::{MemoryStore, MessageStore};

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns false if a subscriber
/// was already installed.
pub fn init_logging(log: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .try_init()
        .is_ok()
}
