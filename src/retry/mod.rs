//! Retransmission timers for unacknowledged QoS 1/2 packets.
//!
//! Every pending entry gets its own tokio task, keyed by
//! (identity, packet id, direction). The task wakes at a fixed interval,
//! asks the session for the retransmission under the session lock and pushes
//! it to the client. It ends itself as soon as the pending entry is gone, so
//! an acknowledgment racing a tick either removes the entry first (the tick
//! no-ops) or sees the retransmission already queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::broker::ClientHandle;
use crate::session::{Direction, Session};

/// Timer key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryKey {
    pub client_id: Arc<str>,
    pub packet_id: u16,
    pub direction: Direction,
}

impl RetryKey {
    pub fn outbound(client_id: &Arc<str>, packet_id: u16) -> Self {
        Self {
            client_id: client_id.clone(),
            packet_id,
            direction: Direction::Outbound,
        }
    }

    pub fn inbound(client_id: &Arc<str>, packet_id: u16) -> Self {
        Self {
            client_id: client_id.clone(),
            packet_id,
            direction: Direction::Inbound,
        }
    }
}

#[derive(Debug)]
struct RetryTimer {
    generation: u64,
    handle: AbortHandle,
}

/// Registry of running retry timers
#[derive(Debug)]
pub struct RetryScheduler {
    interval: Duration,
    timers: Arc<DashMap<RetryKey, RetryTimer>>,
    generation: AtomicU64,
}

impl RetryScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Retransmission interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start (or restart) the timer for a pending entry.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, key: RetryKey, session: Arc<Mutex<Session>>, client: Arc<ClientHandle>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let interval = self.interval;
        let timers = self.timers.clone();
        let task_key = key.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !client.is_alive() {
                    break;
                }

                let packet = {
                    let mut s = session.lock();
                    s.retransmit(task_key.direction, task_key.packet_id, interval)
                };
                let Some(packet) = packet else {
                    trace!(
                        "Pending {:?} packet {} for {} settled",
                        task_key.direction,
                        task_key.packet_id,
                        task_key.client_id
                    );
                    break;
                };

                debug!(
                    "Retrying {:?} for {} (packet_id={})",
                    packet.packet_type(),
                    task_key.client_id,
                    task_key.packet_id
                );
                // A full queue does not settle the entry; the next tick retries
                client.send(packet);
            }

            timers.remove_if(&task_key, |_, t| t.generation == generation);
        });

        let timer = RetryTimer {
            generation,
            handle: join.abort_handle(),
        };
        if let Some(previous) = self.timers.insert(key.clone(), timer) {
            previous.handle.abort();
        }
        // The task may already have finished before it was registered
        if join.is_finished() {
            self.timers.remove_if(&key, |_, t| t.generation == generation);
        }
    }

    /// Stop the timer for one entry. Returns true if one was running.
    pub fn cancel(&self, key: &RetryKey) -> bool {
        match self.timers.remove(key) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every timer belonging to an identity
    pub fn cancel_all(&self, client_id: &str) -> usize {
        let mut cancelled = 0;
        self.timers.retain(|key, timer| {
            if &*key.client_id == client_id {
                timer.handle.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Number of running timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Packet, PubRel, Publish, QoS};
    use bytes::Bytes;

    const INTERVAL: Duration = Duration::from_millis(20);

    fn setup() -> (
        RetryScheduler,
        Arc<Mutex<Session>>,
        Arc<ClientHandle>,
        tokio::sync::mpsc::Receiver<Packet>,
    ) {
        let client_id: Arc<str> = Arc::from("c1");
        let session = Arc::new(Mutex::new(Session::new(client_id.clone(), 1, 60)));
        let (handle, rx) = ClientHandle::new(1, client_id, 16);
        (RetryScheduler::new(INTERVAL), session, Arc::new(handle), rx)
    }

    fn qos1_publish() -> Publish {
        Publish {
            qos: QoS::AtLeastOnce,
            topic: "t".into(),
            payload: Bytes::from_static(b"p"),
            ..Publish::default()
        }
    }

    #[tokio::test]
    async fn test_retransmits_until_acked() {
        let (retry, session, client, mut rx) = setup();
        let id = session
            .lock()
            .register_outbound(qos1_publish(), INTERVAL)
            .and_then(|p| p.packet_id)
            .unwrap();
        retry.schedule(RetryKey::outbound(client.client_id(), id), session.clone(), client.clone());

        match rx.recv().await {
            Some(Packet::Publish(p)) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }

        session.lock().ack_puback(id);
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(retry.is_empty());
    }

    #[tokio::test]
    async fn test_pubrel_retransmit_after_pubrec() {
        let (retry, session, client, mut rx) = setup();
        let mut publish = qos1_publish();
        publish.qos = QoS::ExactlyOnce;
        let id = session
            .lock()
            .register_outbound(publish, INTERVAL)
            .and_then(|p| p.packet_id)
            .unwrap();
        session.lock().ack_pubrec(id, INTERVAL);

        retry.schedule(RetryKey::outbound(client.client_id(), id), session.clone(), client.clone());
        assert_eq!(rx.recv().await, Some(Packet::PubRel(PubRel::new(id))));
        assert!(retry.cancel(&RetryKey::outbound(client.client_id(), id)));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (retry, session, client, _rx) = setup();
        for _ in 0..3 {
            let id = session
                .lock()
                .register_outbound(qos1_publish(), INTERVAL)
                .and_then(|p| p.packet_id)
                .unwrap();
            retry.schedule(RetryKey::outbound(client.client_id(), id), session.clone(), client.clone());
        }
        assert_eq!(retry.len(), 3);
        assert_eq!(retry.cancel_all("c1"), 3);
        assert!(retry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_client_stops_timer() {
        let (retry, session, client, _rx) = setup();
        let id = session
            .lock()
            .register_outbound(qos1_publish(), INTERVAL)
            .and_then(|p| p.packet_id)
            .unwrap();
        retry.schedule(RetryKey::outbound(client.client_id(), id), session.clone(), client.clone());
        client.close("test");
        tokio::time::sleep(INTERVAL * 3).await;
        assert!(retry.is_empty());
    }
}
