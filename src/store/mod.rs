//! Retained and will message storage.
//!
//! [`MessageStore`] is the interface the broker talks to; [`MemoryStore`]
//! is the default in-process implementation. Other backends (Redis, a
//! database) implement the same trait.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Storage backend error
    Storage(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Last retained publish for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Will message registered at CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Storage for retained and will messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    // ========================================================================
    // Will messages
    // ========================================================================

    /// Register (or replace) the will for an identity
    async fn set_will(&self, identity: &str, will: WillMessage) -> Result<()>;

    /// Remove and return the will for an identity
    async fn take_will(&self, identity: &str) -> Result<Option<WillMessage>>;

    /// Drop the will for an identity without returning it
    async fn clear_will(&self, identity: &str) -> Result<()> {
        self.take_will(identity).await.map(|_| ())
    }

    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Store the retained message for its topic, replacing the previous one
    async fn set_retained(&self, message: RetainedMessage) -> Result<()>;

    /// Delete the retained message for a topic
    async fn clear_retained(&self, topic: &str) -> Result<()>;

    /// All retained messages whose topic matches the filter
    async fn retained_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    wills: DashMap<String, WillMessage>,
    retained: DashMap<String, RetainedMessage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained topics
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Number of registered wills
    pub fn will_count(&self) -> usize {
        self.wills.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn set_will(&self, identity: &str, will: WillMessage) -> Result<()> {
        self.wills.insert(identity.to_string(), will);
        Ok(())
    }

    async fn take_will(&self, identity: &str) -> Result<Option<WillMessage>> {
        Ok(self.wills.remove(identity).map(|(_, will)| will))
    }

    async fn set_retained(&self, message: RetainedMessage) -> Result<()> {
        self.retained.insert(message.topic.clone(), message);
        Ok(())
    }

    async fn clear_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic);
        Ok(())
    }

    async fn retained_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>> {
        Ok(self
            .retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect())
    }
}
