//! Disconnect handling and will message publishing

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, State};
use crate::broker::{BrokerEvent, Origin};
use crate::protocol::Publish;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle DISCONNECT: the will is discarded, never delivered
    pub(crate) async fn handle_disconnect(&mut self, identity: &Arc<str>) {
        self.graceful = true;
        if let Err(e) = self.ctx.store.clear_will(identity).await {
            warn!("Failed to clear will for {}: {}", identity, e);
        }
    }

    /// Close path, run exactly once whatever ended the connection.
    ///
    /// Identity cleanup only happens while this connection still owns the
    /// binding; after a takeover the evicting side has already done it.
    /// Every step is best-effort.
    pub(crate) async fn handle_close(&mut self) {
        let (identity, handle) = match std::mem::replace(&mut self.state, State::Closed) {
            State::Connected {
                identity, handle, ..
            } => (identity, handle),
            _ => return,
        };
        handle.close("connection closed");

        let connection_id = self.connection_id;
        let owned = self
            .ctx
            .connections
            .remove_if(&identity, |_, h| h.connection_id() == connection_id)
            .is_some();
        if !owned {
            debug!(
                "Connection {} lost binding for {}, skipping cleanup",
                connection_id, identity
            );
            return;
        }

        if self.graceful {
            if let Err(e) = self.ctx.store.clear_will(&identity).await {
                warn!("Failed to clear will for {}: {}", identity, e);
            }
        } else {
            self.publish_will(&identity).await;
        }

        self.ctx.sessions.remove_if_owned(&identity, connection_id);
        let cancelled = self.ctx.retry.cancel_all(&identity);
        let removed = self.ctx.subscriptions.remove_all(&identity);
        debug!(
            "Cleaned up {}: {} retry timers, {} subscriptions",
            identity, cancelled, removed
        );

        if let Err(e) = self.ctx.hooks.on_client_disconnected(&identity).await {
            warn!("Offline listener failed for {}: {}", identity, e);
        }
        self.ctx.emit(BrokerEvent::ClientDisconnected { identity });
    }

    /// Deliver the will (if any) through the inbound publish path
    async fn publish_will(&mut self, identity: &Arc<str>) {
        let will = match self.ctx.store.take_will(identity).await {
            Ok(Some(will)) => will,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to load will for {}: {}", identity, e);
                return;
            }
        };

        debug!("Publishing will message for {} to {}", identity, will.topic);
        let publish = Publish {
            dup: false,
            qos: will.qos,
            retain: will.retain,
            topic: Arc::from(will.topic.as_str()),
            packet_id: None,
            payload: will.payload,
        };
        let client_id: Arc<str> = Arc::from(will.client_id.as_str());
        let username = self.username.clone();
        self.ctx
            .process_publish(Origin::Local, &client_id, username.as_deref(), publish)
            .await;
    }
}
