//! Per-connection outbound handle.
//!
//! A ClientHandle is what the rest of the broker holds for a live connection:
//! fan-out, retry timers and the cluster bridge push packets through it, and
//! takeover closes the connection through it. The connection task owns the
//! receiving end and writes whatever arrives to its socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::protocol::Packet;

/// Shared handle to a connected client
#[derive(Debug)]
pub struct ClientHandle {
    /// Unique id of the underlying connection
    connection_id: u64,
    /// Identity the connection is bound to
    client_id: Arc<str>,
    /// Outbound packets, drained by the connection task
    tx: mpsc::Sender<Packet>,
    /// Whether the connection is still alive
    alive: AtomicBool,
    /// Why the connection was closed from outside
    close_reason: Mutex<Option<String>>,
    /// Wakes the connection loop on close
    notify: Notify,
}

impl ClientHandle {
    /// Create a handle and the receiver the connection task drains
    pub fn new(
        connection_id: u64,
        client_id: Arc<str>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            connection_id,
            client_id,
            tx,
            alive: AtomicBool::new(true),
            close_reason: Mutex::new(None),
            notify: Notify::new(),
        };
        (handle, rx)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue a packet for this connection.
    ///
    /// Never blocks. Returns false if the connection is closed or its queue
    /// is full.
    pub fn send(&self, packet: Packet) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(e) => {
                trace!("Outbound queue rejected packet for {}: {}", self.client_id, e);
                false
            }
        }
    }

    /// Close the connection. The first reason wins.
    pub fn close(&self, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Reason passed to [`close`](Self::close), if any
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        while self.is_alive() {
            self.notify.notified().await;
        }
    }
}
