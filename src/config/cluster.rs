//! Cluster Configuration
//!
//! Configuration types for bus-based horizontal clustering.

use serde::Deserialize;

/// Default bus channel shared by every node
pub const DEFAULT_CLUSTER_CHANNEL: &str = "tidemq:cluster";

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (taken from the hostname if not set)
    pub node_id: Option<String>,

    /// Bus channel the nodes exchange events on
    /// Default: "tidemq:cluster"
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    DEFAULT_CLUSTER_CHANNEL.to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            channel: default_channel(),
        }
    }
}

impl ClusterConfig {
    /// Get the node ID, falling back to the hostname if not set
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(local_node_id)
    }
}

/// Node id derived from the local hostname
pub fn local_node_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| format!("node-{}", std::process::id()))
}
