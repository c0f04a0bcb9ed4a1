//! MQTT Connection Handler
//!
//! Handles individual client connections, packet processing,
//! and protocol state machine (Connecting -> Connected -> Closed).
//!
//! One task per connection runs decode -> dispatch -> encode in order.
//! Packets produced by other tasks arrive through the connection's
//! [`ClientHandle`] queue and are written from the same loop.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{shutdown_requested, BrokerContext, ClientHandle};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{DecodeError, Packet, ProtocolError};
use crate::session::Session;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT packet
    Connecting,
    /// Connected and running
    Connected {
        identity: Arc<str>,
        session: Arc<Mutex<Session>>,
        handle: Arc<ClientHandle>,
    },
    /// Identity cleanup done
    Closed,
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) connection_id: u64,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) ctx: Arc<BrokerContext>,
    pub(crate) shutdown: watch::Receiver<bool>,
    /// Receiving end of the ClientHandle queue (created after CONNECT)
    pub(crate) outbound: Option<mpsc::Receiver<Packet>>,
    /// Client id from CONNECT (may differ from the identity)
    pub(crate) client_id: Arc<str>,
    /// Username from CONNECT
    pub(crate) username: Option<String>,
    /// Set once DISCONNECT was received
    pub(crate) graceful: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        ctx: Arc<BrokerContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            addr,
            connection_id: ctx.next_connection_id(),
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(ctx.config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            ctx,
            shutdown,
            outbound: None,
            client_id: Arc::from(""),
            username: None,
            graceful: false,
        }
    }

    /// Run the connection handler
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        // Wait for CONNECT packet with timeout
        let connect_timeout = self.ctx.config.connect_timeout;
        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = timeout(connect_timeout, self.read_connect()) => match result {
                Ok(result) => result,
                Err(_) => {
                    debug!("Connect timeout from {}", self.addr);
                    Err(ConnectionError::Timeout)
                }
            },
            _ = shutdown_requested(&mut shutdown) => {
                self.graceful = true;
                Err(ConnectionError::Shutdown)
            }
        };
        if let Err(e) = result {
            // The identity is bound before CONNACK and the online hook run
            self.handle_close().await;
            return Err(e);
        }

        // Main loop
        self.run_connected().await
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (identity, session, handle) = match &self.state {
            State::Connected {
                identity,
                session,
                handle,
            } => (identity.clone(), session.clone(), handle.clone()),
            _ => {
                return Err(ConnectionError::Protocol(
                    ProtocolError::ProtocolViolation("not connected"),
                ))
            }
        };
        let Some(mut outbound) = self.outbound.take() else {
            return Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("missing outbound queue"),
            ));
        };

        let keep_alive_secs = session.lock().keep_alive;
        let heartbeat = self.ctx.config.heartbeat_for(keep_alive_secs);
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            identity, keep_alive_secs, heartbeat
        );

        // Track keep-alive deadline (reset when packets received)
        let mut keep_alive_deadline = Instant::now() + heartbeat;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                // Read from socket
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed from {}", self.addr);
                            self.handle_close().await;
                            return Ok(());
                        }
                        Ok(_) => {
                            // Process packets
                            loop {
                                let (packet, consumed) = match self.decoder.decode(&self.read_buf) {
                                    Ok(Some(decoded)) => decoded,
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!("Malformed packet from {}: {}", identity, e);
                                        self.handle_close().await;
                                        return Err(e.into());
                                    }
                                };
                                self.read_buf.advance(consumed);
                                keep_alive_deadline = Instant::now() + heartbeat;

                                if let Err(e) = self.handle_packet(&identity, &session, packet).await {
                                    match &e {
                                        ConnectionError::Shutdown => {
                                            // DISCONNECT, already handled in handle_packet
                                        }
                                        ConnectionError::Io(_) => {
                                            // IO errors (broken pipe, etc.) are normal during disconnect
                                            debug!("Connection error: {}", e);
                                        }
                                        _ => {
                                            error!("Error handling packet from {}: {}", identity, e);
                                        }
                                    }
                                    self.handle_close().await;
                                    return Err(e);
                                }
                            }
                        }
                        Err(e) => {
                            debug!("Read error: {}", e);
                            self.handle_close().await;
                            return Err(e.into());
                        }
                    }
                }

                // Packets queued by other tasks
                Some(packet) = outbound.recv() => {
                    if let Err(e) = self.write_packet(&packet).await {
                        debug!("Write to {} failed: {}", identity, e);
                        self.handle_close().await;
                        return Err(e);
                    }
                }

                // Closed from outside (takeover, eviction, server disconnect).
                // Not clean: the will goes out unless a takeover already
                // released the identity.
                _ = handle.closed() => {
                    info!(
                        "Closing {}: {}",
                        identity,
                        handle.close_reason().unwrap_or_default()
                    );
                    self.handle_close().await;
                    return Err(ConnectionError::Shutdown);
                }

                _ = shutdown_requested(&mut shutdown) => {
                    debug!("Connection {} shutting down", self.addr);
                    self.graceful = true;
                    self.handle_close().await;
                    return Err(ConnectionError::Shutdown);
                }

                // Keep alive timeout
                _ = tokio::time::sleep_until(keep_alive_deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", identity);
                    self.handle_close().await;
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    /// Handle an incoming packet
    async fn handle_packet(
        &mut self,
        identity: &Arc<str>,
        session: &Arc<Mutex<Session>>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                // Protocol violation - CONNECT already received
                Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "duplicate CONNECT",
                )))
            }
            Packet::Publish(publish) => self.handle_publish(identity, session, publish).await,
            Packet::PubAck(puback) => self.handle_puback(identity, session, puback).await,
            Packet::PubRec(pubrec) => self.handle_pubrec(identity, session, pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(identity, session, pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(identity, session, pubcomp).await,
            Packet::Subscribe(subscribe) => self.handle_subscribe(identity, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(identity, unsubscribe).await
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", identity);
                self.handle_disconnect(identity).await;
                Err(ConnectionError::Shutdown)
            }
            _ => {
                // Server-to-client packet types
                warn!(
                    "Unexpected packet type from {}: {:?}",
                    identity,
                    packet.packet_type()
                );
                Ok(())
            }
        }
    }

    /// Encode and write one packet to the socket
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}
