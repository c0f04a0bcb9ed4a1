//! Session Management
//!
//! Per-identity session state: the packet identifier allocator and the
//! pending acknowledgment tables for outbound QoS 1/2 and inbound QoS 2.
//! Each session sits behind its own mutex, so every register/ack/retransmit
//! for one identity is atomic without a store-wide lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::protocol::{Packet, PubRec, PubRel, Publish, QoS};

/// Retransmission bookkeeping for one pending packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Retransmissions performed so far
    pub attempts: u32,
    /// When the next retransmission is due
    pub next_deadline: Instant,
    /// Set once the entry is acknowledged or released
    pub cancelled: bool,
}

impl RetryState {
    pub fn new(interval: Duration) -> Self {
        Self {
            attempts: 0,
            next_deadline: Instant::now() + interval,
            cancelled: false,
        }
    }

    fn bump(&mut self, interval: Duration) {
        self.attempts += 1;
        self.next_deadline = Instant::now() + interval;
    }
}

/// Where an outbound QoS 1/2 message is in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPhase {
    /// QoS 1 PUBLISH sent
    AwaitingPubAck,
    /// QoS 2 PUBLISH sent
    AwaitingPubRec,
    /// QoS 2 PUBREL sent
    AwaitingPubComp,
}

/// Outbound QoS 1/2 message awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub packet_id: u16,
    /// The PUBLISH exactly as first sent (packet id assigned)
    pub publish: Publish,
    pub phase: OutboundPhase,
    pub retry: RetryState,
}

impl PendingPublish {
    pub fn qos(&self) -> QoS {
        self.publish.qos
    }

    /// Packet to resend for the current phase
    fn retransmission(&self) -> Packet {
        match self.phase {
            OutboundPhase::AwaitingPubAck | OutboundPhase::AwaitingPubRec => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
            OutboundPhase::AwaitingPubComp => Packet::PubRel(PubRel::new(self.packet_id)),
        }
    }
}

/// Inbound QoS 2 message held between PUBREC and PUBREL
#[derive(Debug, Clone)]
pub struct PendingQos2 {
    pub publish: Publish,
    pub retry: RetryState,
}

impl PendingQos2 {
    /// PUBREC answering this message
    pub fn pubrec(&self) -> PubRec {
        PubRec::new(self.publish.packet_id.unwrap_or_default())
    }
}

/// Direction of a pending entry, used to key retry timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Broker -> client PUBLISH/PUBREL
    Outbound,
    /// Client -> broker QoS 2 awaiting PUBREL
    Inbound,
}

/// Client session
#[derive(Debug)]
pub struct Session {
    /// Client identity
    pub client_id: Arc<str>,
    /// Connection currently bound to this session
    pub connection_id: u64,
    /// Keep alive interval requested in CONNECT (seconds)
    pub keep_alive: u16,
    /// Next packet ID to use
    next_packet_id: u16,
    /// Outbound QoS 1/2 awaiting acknowledgment
    pub pending_publishes: HashMap<u16, PendingPublish>,
    /// Inbound QoS 2 awaiting PUBREL
    pub pending_incoming: HashMap<u16, PendingQos2>,
    /// When the session was created
    pub created_at: Instant,
}

impl Session {
    pub fn new(client_id: Arc<str>, connection_id: u64, keep_alive: u16) -> Self {
        Self {
            client_id,
            connection_id,
            keep_alive,
            next_packet_id: 1,
            pending_publishes: HashMap::new(),
            pending_incoming: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    /// Get next packet ID, skipping 0 and identifiers still pending.
    ///
    /// Returns None when all 65535 identifiers are in flight.
    pub fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.pending_publishes.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Assign a packet id to an outbound QoS 1/2 publish and start tracking it.
    ///
    /// Returns the publish as it must go on the wire.
    pub fn register_outbound(&mut self, mut publish: Publish, interval: Duration) -> Option<Publish> {
        let phase = match publish.qos {
            QoS::AtMostOnce => return Some(publish),
            QoS::AtLeastOnce => OutboundPhase::AwaitingPubAck,
            QoS::ExactlyOnce => OutboundPhase::AwaitingPubRec,
        };
        let packet_id = self.next_packet_id()?;
        publish.packet_id = Some(packet_id);
        publish.dup = false;

        self.pending_publishes.insert(
            packet_id,
            PendingPublish {
                packet_id,
                publish: publish.clone(),
                phase,
                retry: RetryState::new(interval),
            },
        );
        Some(publish)
    }

    /// PUBACK: release a QoS 1 entry
    pub fn ack_puback(&mut self, packet_id: u16) -> Option<PendingPublish> {
        self.remove_in_phase(packet_id, OutboundPhase::AwaitingPubAck)
    }

    /// PUBREC: move a QoS 2 entry to the PUBREL phase.
    ///
    /// Returns false if no entry awaits PUBREC under this id.
    pub fn ack_pubrec(&mut self, packet_id: u16, interval: Duration) -> bool {
        match self.pending_publishes.get_mut(&packet_id) {
            Some(pending) if pending.phase == OutboundPhase::AwaitingPubRec => {
                pending.phase = OutboundPhase::AwaitingPubComp;
                pending.retry = RetryState::new(interval);
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP: release a QoS 2 entry
    pub fn ack_pubcomp(&mut self, packet_id: u16) -> Option<PendingPublish> {
        self.remove_in_phase(packet_id, OutboundPhase::AwaitingPubComp)
    }

    fn remove_in_phase(&mut self, packet_id: u16, phase: OutboundPhase) -> Option<PendingPublish> {
        if self.pending_publishes.get(&packet_id)?.phase != phase {
            return None;
        }
        let mut pending = self.pending_publishes.remove(&packet_id)?;
        pending.retry.cancelled = true;
        Some(pending)
    }

    /// Hold an inbound QoS 2 publish until PUBREL.
    ///
    /// Returns false if the id is already pending (a retransmitted PUBLISH);
    /// the stored message is kept as-is.
    pub fn store_incoming(&mut self, packet_id: u16, publish: Publish, interval: Duration) -> bool {
        if self.pending_incoming.contains_key(&packet_id) {
            return false;
        }
        self.pending_incoming.insert(
            packet_id,
            PendingQos2 {
                publish,
                retry: RetryState::new(interval),
            },
        );
        true
    }

    /// PUBREL: take the held message. None if already released.
    pub fn release_incoming(&mut self, packet_id: u16) -> Option<Publish> {
        self.pending_incoming.remove(&packet_id).map(|mut pending| {
            pending.retry.cancelled = true;
            pending.publish
        })
    }

    /// Build the retransmission for a pending entry and advance its retry state.
    ///
    /// Returns None once the entry has been acknowledged, which ends the timer.
    pub fn retransmit(
        &mut self,
        direction: Direction,
        packet_id: u16,
        interval: Duration,
    ) -> Option<Packet> {
        match direction {
            Direction::Outbound => {
                let pending = self.pending_publishes.get_mut(&packet_id)?;
                if pending.retry.cancelled {
                    return None;
                }
                pending.retry.bump(interval);
                Some(pending.retransmission())
            }
            Direction::Inbound => {
                let pending = self.pending_incoming.get_mut(&packet_id)?;
                if pending.retry.cancelled {
                    return None;
                }
                pending.retry.bump(interval);
                Some(Packet::PubRec(pending.pubrec()))
            }
        }
    }

    /// Drop all pending state
    pub fn clear(&mut self) {
        self.pending_publishes.clear();
        self.pending_incoming.clear();
    }
}

/// Session store
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<Mutex<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh session for an identity, replacing any previous one
    pub fn create(
        &self,
        client_id: &Arc<str>,
        connection_id: u64,
        keep_alive: u16,
    ) -> Arc<Mutex<Session>> {
        let session = Arc::new(Mutex::new(Session::new(
            client_id.clone(),
            connection_id,
            keep_alive,
        )));
        if let Some(previous) = self.sessions.insert(client_id.clone(), session.clone()) {
            previous.lock().clear();
        }
        session
    }

    /// Get a session by client ID
    pub fn get(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Remove a session, releasing its pending state
    pub fn remove(&self, client_id: &str) -> bool {
        match self.sessions.remove(client_id) {
            Some((_, session)) => {
                session.lock().clear();
                true
            }
            None => false,
        }
    }

    /// Remove the session only if it still belongs to the given connection
    pub fn remove_if_owned(&self, client_id: &str, connection_id: u64) -> bool {
        match self
            .sessions
            .remove_if(client_id, |_, s| s.lock().connection_id == connection_id)
        {
            Some((_, session)) => {
                session.lock().clear();
                true
            }
            None => false,
        }
    }

    /// Get number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session
    pub fn clear(&self) {
        self.sessions.clear();
    }
}
