//! Correlation of synchronous requests with their replies.
//!
//! Each outstanding request is parked in a lock-free table under its
//! correlation id; the session loop completes it when a matching reply
//! frame arrives, and disconnect paths fail everything addressed to the
//! departed peer.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tether_wire::Envelope;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// One request awaiting its reply.
struct PendingCall {
    peer: String,
    issued_at: Instant,
    reply_tx: oneshot::Sender<Envelope>,
}

/// Table of in-flight synchronous requests.
#[derive(Default)]
pub struct Correlator {
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id and park a waiter under it.
    ///
    /// The waiter is registered before the request frame goes out, so a
    /// reply can never race ahead of its slot.
    pub fn register(&self, peer: &str) -> (u64, oneshot::Receiver<Envelope>) {
        let corr_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            corr_id,
            PendingCall {
                peer: peer.to_string(),
                issued_at: Instant::now(),
                reply_tx,
            },
        );
        trace!(corr_id, peer, "registered pending call");
        (corr_id, reply_rx)
    }

    /// Deliver a reply to its waiter.
    ///
    /// Returns the round-trip latency if a waiter was found. Replies with
    /// no matching entry (already timed out, or never issued) are reported
    /// as `None` and otherwise ignored.
    pub fn complete(&self, corr_id: u64, reply: Envelope) -> Option<Duration> {
        match self.pending.remove(&corr_id) {
            Some((_, call)) => {
                let elapsed = call.issued_at.elapsed();
                // Waiter may have given up between removal and send.
                let _ = call.reply_tx.send(reply);
                trace!(corr_id, ?elapsed, "completed pending call");
                Some(elapsed)
            }
            None => {
                debug!(corr_id, "reply without a pending call, dropping");
                None
            }
        }
    }

    /// Discard a waiter that gave up, typically on timeout.
    pub fn abandon(&self, corr_id: u64) {
        self.pending.remove(&corr_id);
    }

    /// Fail every call addressed to a departing peer.
    ///
    /// Dropping the sender wakes each waiter with a channel-closed error,
    /// which the caller surfaces as a disconnect.
    pub fn fail_peer(&self, peer: &str) {
        self.pending.retain(|_, call| call.peer != peer);
    }

    /// Fail every outstanding call, used at shutdown.
    pub fn fail_all(&self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_complete() {
        let correlator = Correlator::new();
        let (corr_id, reply_rx) = correlator.register("10.0.0.1:5000");

        let latency = correlator.complete(corr_id, Envelope::new("pong"));
        assert!(latency.is_some());

        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.payload.unwrap().as_ref(), b"pong");
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let correlator = Correlator::new();
        assert!(correlator.complete(999, Envelope::new("stray")).is_none());
    }

    #[tokio::test]
    async fn test_abandon_makes_late_reply_inert() {
        let correlator = Correlator::new();
        let (corr_id, reply_rx) = correlator.register("10.0.0.1:5000");

        correlator.abandon(corr_id);
        drop(reply_rx);

        assert!(correlator.complete(corr_id, Envelope::new("late")).is_none());
    }

    #[tokio::test]
    async fn test_fail_peer_wakes_only_that_peers_waiters() {
        let correlator = Correlator::new();
        let (_, rx_a) = correlator.register("10.0.0.1:5000");
        let (id_b, rx_b) = correlator.register("10.0.0.2:5000");

        correlator.fail_peer("10.0.0.1:5000");

        assert!(rx_a.await.is_err());
        assert_eq!(correlator.len(), 1);

        correlator.complete(id_b, Envelope::new("still alive"));
        assert!(rx_b.await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = Correlator::new();
        let (_, rx_a) = correlator.register("10.0.0.1:5000");
        let (_, rx_b) = correlator.register("10.0.0.2:5000");

        correlator.fail_all();

        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert!(correlator.is_empty());
    }
}
