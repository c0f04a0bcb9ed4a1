//! Hooks Module
//!
//! Provides extensibility points for identity, authentication, subscription
//! checks and message/connection listeners in TideMQ.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{QoS, Subscription};


/// Hook error types
///
/// The broker logs hook errors. An erroring authentication or subscribe
/// check counts as a refusal.
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// Implement this trait to customize identity, authentication, subscription
/// checks and event handling. All methods have default implementations that
/// allow everything.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Derive the identity a connection is bound to
    ///
    /// At most one live connection holds an identity, across every node of
    /// a cluster. Returning an empty string rejects the client with
    /// CONNACK 0x02 (identifier rejected).
    async fn unique_id(
        &self,
        client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> String {
        client_id.to_string()
    }

    /// Called when a client attempts to authenticate
    ///
    /// # Arguments
    /// * `identity` - The identity from [`unique_id`](Hooks::unique_id)
    /// * `client_id` - The client identifier from CONNECT
    /// * `username` - Optional username from CONNECT packet
    /// * `password` - Optional password from CONNECT packet
    ///
    /// # Returns
    /// * `Ok(true)` - Authentication successful
    /// * `Ok(false)` - Authentication failed (CONNACK 0x04)
    /// * `Err(_)` - Internal error occurred (treated as failure)
    async fn on_authenticate(
        &self,
        _identity: &str,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true) // Default: allow all
    }

    /// Called with the whole filter list of a SUBSCRIBE
    ///
    /// Returning `Ok(false)` fails every entry of the SUBACK.
    async fn is_valid_subscribe(
        &self,
        _identity: &str,
        _subscriptions: &[Subscription],
    ) -> HookResult<bool> {
        Ok(true) // Default: allow all
    }

    /// Called after CONNACK has been sent (client online)
    ///
    /// Errors are logged; the client stays connected.
    async fn on_client_connected(&self, _identity: &str) -> HookResult<()> {
        Ok(()) // Default: no-op
    }

    /// Called once identity cleanup has finished (client offline)
    async fn on_client_disconnected(&self, _identity: &str) -> HookResult<()> {
        Ok(()) // Default: no-op
    }

    /// Called for every message a local client publishes (and for will
    /// delivery), before fan-out
    ///
    /// Errors are logged and do not stop delivery.
    async fn on_message(
        &self,
        _client_id: &str,
        _topic: &str,
        _qos: QoS,
        _payload: &Bytes,
    ) -> HookResult<()> {
        Ok(()) // Default: no-op
    }
}

/// Default hooks implementation that allows everything
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {
    // All methods use default implementations (allow all, no-op)
}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

/// Implement Hooks for Arc<T> where T: Hooks
/// This allows Arc-wrapped hook providers to be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn unique_id(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> String {
        (**self).unique_id(client_id, username, password).await
    }

    async fn on_authenticate(
        &self,
        identity: &str,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .on_authenticate(identity, client_id, username, password)
            .await
    }

    async fn is_valid_subscribe(
        &self,
        identity: &str,
        subscriptions: &[Subscription],
    ) -> HookResult<bool> {
        (**self).is_valid_subscribe(identity, subscriptions).await
    }

    async fn on_client_connected(&self, identity: &str) -> HookResult<()> {
        (**self).on_client_connected(identity).await
    }

    async fn on_client_disconnected(&self, identity: &str) -> HookResult<()> {
        (**self).on_client_disconnected(identity).await
    }

    async fn on_message(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        payload: &Bytes,
    ) -> HookResult<()> {
        (**self).on_message(client_id, topic, qos, payload).await
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// For identity: the first hook decides
/// For authentication and subscribe checks: all hooks must return `Ok(true)`
/// For events and listeners: all hooks are called in order
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    /// Create a new composite hooks instance
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hooks implementation
    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn unique_id(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> String {
        match self.hooks.first() {
            Some(hooks) => hooks.unique_id(client_id, username, password).await,
            None => client_id.to_string(),
        }
    }

    async fn on_authenticate(
        &self,
        identity: &str,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks
                .on_authenticate(identity, client_id, username, password)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_valid_subscribe(
        &self,
        identity: &str,
        subscriptions: &[Subscription],
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.is_valid_subscribe(identity, subscriptions).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, identity: &str) -> HookResult<()> {
        let mut result = Ok(());
        for hooks in &self.hooks {
            if let Err(e) = hooks.on_client_connected(identity).await {
                result = Err(e);
            }
        }
        result
    }

    async fn on_client_disconnected(&self, identity: &str) -> HookResult<()> {
        let mut result = Ok(());
        for hooks in &self.hooks {
            if let Err(e) = hooks.on_client_disconnected(identity).await {
                result = Err(e);
            }
        }
        result
    }

    async fn on_message(
        &self,
        client_id: &str,
        topic: &str,
        qos: QoS,
        payload: &Bytes,
    ) -> HookResult<()> {
        let mut result = Ok(());
        for hooks in &self.hooks {
            if let Err(e) = hooks.on_message(client_id, topic, qos, payload).await {
                result = Err(e);
            }
        }
        result
    }
}
