//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::{Connection, ConnectionError, State};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::retry::RetryKey;
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle PUBACK packet
    pub(crate) async fn handle_puback(
        &mut self,
        identity: &Arc<str>,
        session: &Arc<Mutex<Session>>,
        puback: PubAck,
    ) -> Result<(), ConnectionError> {
        let acked = session.lock().ack_puback(puback.packet_id).is_some();
        if acked {
            self.ctx
                .retry
                .cancel(&RetryKey::outbound(identity, puback.packet_id));
        } else {
            trace!("PUBACK for unknown packet {} from {}", puback.packet_id, identity);
        }
        Ok(())
    }

    /// Handle PUBREC packet
    ///
    /// PUBREL is sent even for unknown ids so a client that lost our
    /// PUBREL can still finish its handshake.
    pub(crate) async fn handle_pubrec(
        &mut self,
        identity: &Arc<str>,
        session: &Arc<Mutex<Session>>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        let advanced = session
            .lock()
            .ack_pubrec(pubrec.packet_id, self.ctx.retry.interval());

        // Send PUBREL
        self.write_packet(&Packet::PubRel(PubRel::new(pubrec.packet_id)))
            .await?;

        if advanced {
            // Replaces the PUBLISH timer with a PUBREL timer
            if let State::Connected { handle, .. } = &self.state {
                self.ctx.retry.schedule(
                    RetryKey::outbound(identity, pubrec.packet_id),
                    session.clone(),
                    handle.clone(),
                );
            }
        }
        Ok(())
    }

    /// Handle PUBREL packet
    pub(crate) async fn handle_pubrel(
        &mut self,
        identity: &Arc<str>,
        session: &Arc<Mutex<Session>>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        // Get the stored message; only the first PUBREL finds it
        let publish = session.lock().release_incoming(pubrel.packet_id);
        self.ctx
            .retry
            .cancel(&RetryKey::inbound(identity, pubrel.packet_id));

        // Send PUBCOMP
        self.write_packet(&Packet::PubComp(PubComp::new(pubrel.packet_id)))
            .await?;

        // Now route the message to subscribers (QoS 2 delivery complete)
        match publish {
            Some(publish) => self.route_message(publish).await,
            None => trace!(
                "PUBREL for released packet {} from {}",
                pubrel.packet_id,
                identity
            ),
        }

        Ok(())
    }

    /// Handle PUBCOMP packet
    pub(crate) async fn handle_pubcomp(
        &mut self,
        identity: &Arc<str>,
        session: &Arc<Mutex<Session>>,
        pubcomp: PubComp,
    ) -> Result<(), ConnectionError> {
        if session.lock().ack_pubcomp(pubcomp.packet_id).is_some() {
            self.ctx
                .retry
                .cancel(&RetryKey::outbound(identity, pubcomp.packet_id));
        }
        Ok(())
    }
}
