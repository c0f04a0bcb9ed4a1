//! PUBLISH packet handling

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError, State};
use crate::broker::Origin;
use crate::protocol::{Packet, PubAck, PubRec, Publish, QoS};
use crate::retry::RetryKey;
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle an inbound PUBLISH
    ///
    /// - QoS 0: deliver
    /// - QoS 1: deliver, then PUBACK
    /// - QoS 2: hold until PUBREL, answer PUBREC (resent until PUBREL arrives)
    pub(crate) async fn handle_publish(
        &mut self,
        identity: &Arc<str>,
        session: &Arc<Mutex<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        trace!(
            "PUBLISH from {} on {} (qos={:?}, retain={}, dup={})",
            identity,
            publish.topic,
            publish.qos,
            publish.retain,
            publish.dup
        );

        match publish.qos {
            QoS::AtMostOnce => {
                self.route_message(publish).await;
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.unwrap_or_default();
                self.route_message(publish).await;
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id))).await
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap_or_default();
                let stored = {
                    let mut s = session.lock();
                    s.store_incoming(packet_id, publish, self.ctx.retry.interval())
                };
                if !stored {
                    debug!(
                        "Duplicate QoS 2 PUBLISH {} from {}, resending PUBREC",
                        packet_id, identity
                    );
                }

                self.write_packet(&Packet::PubRec(PubRec::new(packet_id))).await?;

                if stored {
                    if let State::Connected { handle, .. } = &self.state {
                        self.ctx.retry.schedule(
                            RetryKey::inbound(identity, packet_id),
                            session.clone(),
                            handle.clone(),
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Run a message accepted from this client through the inbound path
    pub(crate) async fn route_message(&mut self, publish: Publish) {
        let client_id = self.client_id.clone();
        let username = self.username.clone();
        self.ctx
            .process_publish(Origin::Local, &client_id, username.as_deref(), publish)
            .await;
    }
}
