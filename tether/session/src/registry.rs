//! Registry of live client sessions keyed by peer address.

use crate::session::SessionCommand;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Handle to one live session, sufficient to route commands to it.
#[derive(Clone)]
pub struct ClientHandle {
    /// Peer address in `ip:port` form, the registry key.
    pub peer: String,
    /// Monotonic session identifier, used to guard against stale removal.
    pub session_id: u64,
    /// Command channel into the session task.
    pub cmd_tx: mpsc::Sender<SessionCommand>,
}

/// Shared map of connected clients.
///
/// A reconnecting peer reuses its `ip:port` key, so registration replaces
/// any existing entry and hands the superseded handle back to the caller
/// for teardown.
#[derive(Default)]
pub struct Registry {
    clients: RwLock<HashMap<String, ClientHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the handle it displaced, if any.
    pub async fn register(&self, handle: ClientHandle) -> Option<ClientHandle> {
        let mut clients = self.clients.write().await;
        let superseded = clients.insert(handle.peer.clone(), handle);
        if superseded.is_some() {
            debug!("registration superseded an existing session");
        }
        superseded
    }

    /// Remove a session, but only if the entry still belongs to it.
    ///
    /// A session that was superseded must not tear out its replacement on
    /// the way down, hence the `session_id` guard.
    pub async fn unregister(&self, peer: &str, session_id: u64) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(peer) {
            Some(current) if current.session_id == session_id => {
                clients.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Look up the handle for a peer address.
    pub async fn lookup(&self, peer: &str) -> Option<ClientHandle> {
        self.clients.read().await.get(peer).cloned()
    }

    /// Whether a peer is currently connected.
    pub async fn contains(&self, peer: &str) -> bool {
        self.clients.read().await.contains_key(peer)
    }

    /// Peer addresses of all connected clients, in no particular order.
    pub async fn list(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Snapshot of every live handle.
    pub async fn handles(&self) -> Vec<ClientHandle> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

/// Hand out monotonically increasing session identifiers.
pub fn next_session_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(peer: &str, session_id: u64) -> ClientHandle {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        ClientHandle {
            peer: peer.to_string(),
            session_id,
            cmd_tx,
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = Registry::new();
        assert!(registry.register(handle("10.0.0.1:5000", 1)).await.is_none());

        assert!(registry.contains("10.0.0.1:5000").await);
        assert_eq!(registry.lookup("10.0.0.1:5000").await.unwrap().session_id, 1);
        assert_eq!(registry.list().await, vec!["10.0.0.1:5000".to_string()]);
    }

    #[tokio::test]
    async fn test_register_replaces_same_peer() {
        let registry = Registry::new();
        registry.register(handle("10.0.0.1:5000", 1)).await;

        let superseded = registry.register(handle("10.0.0.1:5000", 2)).await;
        assert_eq!(superseded.unwrap().session_id, 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.lookup("10.0.0.1:5000").await.unwrap().session_id, 2);
    }

    #[tokio::test]
    async fn test_unregister_is_guarded_by_session_id() {
        let registry = Registry::new();
        registry.register(handle("10.0.0.1:5000", 1)).await;
        registry.register(handle("10.0.0.1:5000", 2)).await;

        // Stale session must not remove its replacement.
        assert!(!registry.unregister("10.0.0.1:5000", 1).await);
        assert!(registry.contains("10.0.0.1:5000").await);

        assert!(registry.unregister("10.0.0.1:5000", 2).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
    }
}
