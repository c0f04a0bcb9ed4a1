//! Topic matching and subscription management
//!
//! The subscription index maps each topic filter to the clients holding it.
//! Lookups scan every registered filter with [`topic_matches_filter`]; the
//! outer and inner maps are sharded `DashMap`s so no single lock covers the
//! whole index.

pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use dashmap::DashMap;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter as subscribed
    pub filter: Arc<str>,
    /// Client identity holding the subscription
    pub client_id: Arc<str>,
    /// Maximum QoS granted
    pub qos: QoS,
}

/// Search result; most topics have few subscribers
pub type Matches = SmallVec<[Subscription; 16]>;

/// Concurrent subscription index: filter -> (client -> qos)
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    filters: DashMap<Arc<str>, DashMap<Arc<str>, QoS>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription.
    ///
    /// Returns true if the client did not already hold this filter.
    pub fn add(&self, filter: &str, client_id: &Arc<str>, qos: QoS) -> bool {
        // The outer entry guard stays held across the inner insert so a
        // concurrent remove cannot drop the filter in between.
        let clients = self.filters.entry(Arc::from(filter)).or_default();
        clients.insert(client_id.clone(), qos).is_none()
    }

    /// Remove one subscription. Returns true if it existed.
    pub fn remove(&self, filter: &str, client_id: &str) -> bool {
        let removed = match self.filters.get(filter) {
            Some(clients) => clients.remove(client_id).is_some(),
            None => false,
        };
        if removed {
            self.filters.remove_if(filter, |_, clients| clients.is_empty());
        }
        removed
    }

    /// Remove every subscription held by a client. Returns how many were removed.
    pub fn remove_all(&self, client_id: &str) -> usize {
        let mut removed = 0;
        self.filters.retain(|_, clients| {
            if clients.remove(client_id).is_some() {
                removed += 1;
            }
            !clients.is_empty()
        });
        removed
    }

    /// All subscriptions whose filter matches the topic name
    pub fn search(&self, topic: &str) -> Matches {
        let mut result = Matches::new();
        for entry in self.filters.iter() {
            if !topic_matches_filter(topic, entry.key()) {
                continue;
            }
            for client in entry.value().iter() {
                result.push(Subscription {
                    filter: entry.key().clone(),
                    client_id: client.key().clone(),
                    qos: *client.value(),
                });
            }
        }
        result
    }

    /// Subscriptions of one client whose filter matches the topic name
    pub fn search_client(&self, topic: &str, client_id: &str) -> Matches {
        let mut result = Matches::new();
        for entry in self.filters.iter() {
            if !topic_matches_filter(topic, entry.key()) {
                continue;
            }
            if let Some(client) = entry.value().get(client_id) {
                result.push(Subscription {
                    filter: entry.key().clone(),
                    client_id: client.key().clone(),
                    qos: *client.value(),
                });
            }
        }
        result
    }

    /// Filters currently held by a client
    pub fn client_filters(&self, client_id: &str) -> Vec<Subscription> {
        self.filters
            .iter()
            .filter_map(|entry| {
                entry.value().get(client_id).map(|qos| Subscription {
                    filter: entry.key().clone(),
                    client_id: Arc::from(client_id),
                    qos: *qos,
                })
            })
            .collect()
    }

    /// Number of distinct filters
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Total number of (filter, client) pairs
    pub fn subscription_count(&self) -> usize {
        self.filters.iter().map(|entry| entry.value().len()).sum()
    }
}
