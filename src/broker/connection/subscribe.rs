//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;

use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError};
use crate::broker::BrokerEvent;
use crate::protocol::{
    Packet, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::validate_topic_filter;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet
    pub(crate) async fn handle_subscribe(
        &mut self,
        identity: &Arc<str>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let allowed = match self
            .ctx
            .hooks
            .is_valid_subscribe(identity, &subscribe.subscriptions)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Subscribe check failed for {}: {}", identity, e);
                false
            }
        };

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted: SmallVec<[(String, QoS); 4]> = SmallVec::new();

        for sub in subscribe.subscriptions {
            if !allowed {
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }
            if let Err(reason) = validate_topic_filter(&sub.filter) {
                debug!("Rejecting filter {:?} from {}: {}", sub.filter, identity, reason);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let qos = sub.qos.min(self.ctx.config.max_qos);
            self.ctx.subscriptions.add(&sub.filter, identity, qos);
            debug!("{} subscribed to {} (qos={:?})", identity, sub.filter, qos);
            self.ctx.emit(BrokerEvent::SubscriptionAdded {
                identity: identity.clone(),
                filter: sub.filter.clone(),
                qos,
            });
            return_codes.push(SubAckReturnCode::Granted(qos));
            granted.push((sub.filter, qos));
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        // Retained messages follow the SUBACK
        for (filter, qos) in granted {
            self.send_retained_messages(identity, &filter, qos).await;
        }

        Ok(())
    }

    /// Queue every retained message matching a new subscription
    async fn send_retained_messages(&mut self, identity: &Arc<str>, filter: &str, granted: QoS) {
        if !self.ctx.config.retain_available {
            return;
        }
        let retained = match self.ctx.store.retained_matching(filter).await {
            Ok(retained) => retained,
            Err(e) => {
                warn!("Failed to load retained messages for {}: {}", filter, e);
                return;
            }
        };

        for msg in retained {
            let publish = Publish {
                dup: false,
                qos: msg.qos.min(granted),
                retain: true,
                topic: Arc::from(msg.topic.as_str()),
                packet_id: None,
                payload: msg.payload,
            };
            if !self.ctx.deliver(identity, publish) {
                debug!("Retained {} not queued for {}", msg.topic, identity);
            }
        }
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        identity: &Arc<str>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in unsubscribe.filters {
            if self.ctx.subscriptions.remove(&filter, identity) {
                debug!("{} unsubscribed from {}", identity, filter);
                self.ctx.emit(BrokerEvent::SubscriptionRemoved {
                    identity: identity.clone(),
                    filter,
                });
            }
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
            .await
    }
}
