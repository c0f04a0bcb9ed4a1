//! CONNECT packet handling

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{Connection, ConnectionError, State};
use crate::broker::{BrokerEvent, ClientHandle};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError,
};
use crate::store::WillMessage;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Try to decode a packet from the buffer
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);

                    match packet {
                        Packet::Connect(connect) => {
                            return self.handle_connect(*connect).await;
                        }
                        _ => {
                            // Protocol violation - first packet must be CONNECT
                            debug!("First packet from {} was not CONNECT", self.addr);
                            return Err(ConnectionError::Protocol(
                                ProtocolError::ProtocolViolation("first packet must be CONNECT"),
                            ));
                        }
                    }
                }
                Ok(None) => {
                    // Need more data
                }
                Err(DecodeError::UnacceptableProtocolVersion(level)) => {
                    debug!("Unacceptable protocol level {} from {}", level, self.addr);
                    let connack = ConnAck::new(ConnectReturnCode::UnacceptableProtocolVersion);
                    if self.write_packet(&Packet::ConnAck(connack)).await.is_ok() {
                        let _ = self.stream.flush().await;
                    }
                    return Err(DecodeError::UnacceptableProtocolVersion(level).into());
                }
                Err(e) => {
                    debug!("Invalid CONNECT from {}: {}", self.addr, e);
                    return Err(e.into());
                }
            }

            // Read more data
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Reply with a refusing CONNACK and fail the connection
    async fn reject(
        &mut self,
        code: ConnectReturnCode,
        reason: &'static str,
    ) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck::new(code))).await?;
        let _ = self.stream.flush().await;
        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
            reason,
        )))
    }

    /// Handle CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let hooks = self.ctx.hooks.clone();
        let identity = hooks
            .unique_id(
                &connect.client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;

        if identity.is_empty() {
            debug!("Rejecting empty identity from {}", self.addr);
            return self
                .reject(ConnectReturnCode::IdentifierRejected, "empty client identity")
                .await;
        }
        let identity: Arc<str> = identity.into();

        debug!(
            "CONNECT from {} (client_id: {}, identity: {})",
            self.addr, connect.client_id, identity
        );

        // Authenticate the client
        let authenticated = match hooks
            .on_authenticate(
                &identity,
                &connect.client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Authentication error for {}: {}", identity, e);
                false
            }
        };
        if !authenticated {
            debug!("Authentication failed for {}", identity);
            return self
                .reject(
                    ConnectReturnCode::BadUserNameOrPassword,
                    "authentication failed",
                )
                .await;
        }

        // Check max_connections limit
        // Only count as new connection if the identity is not already connected
        let is_takeover = self.ctx.connections.contains_key(&identity);
        if !is_takeover && self.ctx.connections.len() >= self.ctx.config.max_connections {
            debug!(
                "Max connections ({}) reached, rejecting {}",
                self.ctx.config.max_connections, identity
            );
            return self
                .reject(
                    ConnectReturnCode::ServerUnavailable,
                    "max connections reached",
                )
                .await;
        }

        // Bind the identity to this connection
        let (handle, outbound) = ClientHandle::new(
            self.connection_id,
            identity.clone(),
            self.ctx.config.outbound_channel_capacity,
        );
        let handle = Arc::new(handle);
        if let Some(previous) = self.ctx.connections.insert(identity.clone(), handle.clone()) {
            info!(
                "Identity {} rebound from connection {} to {}",
                identity,
                previous.connection_id(),
                self.connection_id
            );
            self.ctx.release_identity(&identity).await;
            previous.close("rebound on new connection");
        }

        let session = self
            .ctx
            .sessions
            .create(&identity, self.connection_id, connect.keep_alive);

        // From here on the close path owns the binding
        self.client_id = connect.client_id.as_str().into();
        self.username = connect.username;
        self.outbound = Some(outbound);
        self.state = State::Connected {
            identity: identity.clone(),
            session,
            handle,
        };

        // Store will message
        if let Some(will) = connect.will {
            let will = WillMessage {
                client_id: connect.client_id,
                topic: will.topic,
                payload: will.payload,
                qos: will.qos,
                retain: will.retain,
            };
            if let Err(e) = self.ctx.store.set_will(&identity, will).await {
                warn!("Failed to store will for {}: {}", identity, e);
            }
        }

        // Send CONNACK
        self.write_packet(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
            .await?;
        debug!("CONNACK sent to {}", identity);

        if let Err(e) = hooks.on_client_connected(&identity).await {
            warn!("Online listener failed for {}: {}", identity, e);
        }

        // Notify event subscribers
        self.ctx.emit(BrokerEvent::ClientConnected {
            identity,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            peer: self.addr,
        });

        Ok(())
    }
}
