//! Lifecycle and message notification contracts.
//!
//! The embedding application observes the server through registered trait
//! objects: any number of [`ServerEventHandler`]s for connect/disconnect and
//! plain message delivery, plus at most one [`ReplyHandler`] that produces
//! the reply for each inbound sync request.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tether_wire::Envelope;
use tracing::warn;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection cleanly
    PeerClosed,
    /// A socket or decode error terminated the session
    SocketError,
    /// The session exceeded the idle timeout
    Timeout,
    /// The session was removed by an explicit disconnect request
    Removed,
    /// The server was stopped or disposed
    Shutdown,
    /// A newer connection from the same peer address replaced this session
    Superseded,
    /// The preshared-key exchange failed
    AuthFailure,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::PeerClosed => "peer closed",
            DisconnectReason::SocketError => "socket error",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Removed => "removed",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Superseded => "superseded",
            DisconnectReason::AuthFailure => "authentication failure",
        };
        f.write_str(s)
    }
}

/// Observer for server lifecycle and plain message events.
///
/// All methods default to no-ops so implementors subscribe only to what they
/// need. Handlers run on session tasks and must not block.
pub trait ServerEventHandler: Send + Sync {
    /// A client completed its handshake and is now connected.
    fn client_connected(&self, _peer: &str) {}

    /// A client's session ended. Fires with [`DisconnectReason::AuthFailure`]
    /// for peers rejected during the preshared-key exchange, without a
    /// preceding connect event.
    fn client_disconnected(&self, _peer: &str, _reason: DisconnectReason) {}

    /// A plain (non-sync) envelope arrived from a client.
    fn message_received(&self, _peer: &str, _envelope: &Envelope) {}
}

/// Produces the reply for an inbound sync request.
///
/// Invoked synchronously with respect to the request; must return exactly
/// one reply envelope. Errors are converted into a best-effort error reply
/// so the remote caller resolves instead of waiting out its timeout.
pub trait ReplyHandler: Send + Sync {
    /// Handle one sync request from `peer` and produce the reply.
    fn handle(&self, peer: &str, request: Envelope) -> anyhow::Result<Envelope>;
}

/// Registered observer set.
///
/// Delivery is fan-out: a panicking observer is caught and logged so it
/// never breaks delivery to the others. The lock is only held to snapshot
/// the handler list, never across a handler call.
#[derive(Default)]
pub struct Observers {
    handlers: RwLock<Vec<Arc<dyn ServerEventHandler>>>,
}

impl Observers {
    /// Create an empty observer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn register(&self, handler: Arc<dyn ServerEventHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ServerEventHandler>> {
        self.handlers
            .read()
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }

    /// Notify all observers of a connect.
    pub fn notify_connected(&self, peer: &str) {
        for handler in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler.client_connected(peer))).is_err() {
                warn!("event handler panicked in client_connected for {}", peer);
            }
        }
    }

    /// Notify all observers of a disconnect.
    pub fn notify_disconnected(&self, peer: &str, reason: DisconnectReason) {
        for handler in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler.client_disconnected(peer, reason)))
                .is_err()
            {
                warn!("event handler panicked in client_disconnected for {}", peer);
            }
        }
    }

    /// Notify all observers of a plain inbound message.
    pub fn notify_message(&self, peer: &str, envelope: &Envelope) {
        for handler in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler.message_received(peer, envelope))).is_err()
            {
                warn!("event handler panicked in message_received for {}", peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl ServerEventHandler for Counter {
        fn client_connected(&self, _peer: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl ServerEventHandler for Panicker {
        fn client_connected(&self, _peer: &str) {
            panic!("observer failure");
        }
    }

    #[test]
    fn test_panicking_observer_does_not_break_others() {
        let observers = Observers::new();
        let first = Arc::new(Counter(AtomicUsize::new(0)));
        let second = Arc::new(Counter(AtomicUsize::new(0)));

        observers.register(first.clone());
        observers.register(Arc::new(Panicker));
        observers.register(second.clone());

        observers.notify_connected("127.0.0.1:1234");

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }
}
