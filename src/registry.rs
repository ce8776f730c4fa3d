//! Connection registry
//!
//! The one piece of state shared by every connection task: a concurrent
//! map from `ConnectionId` to the connection's shareable handle. Callers
//! never lock; `DashMap` shards do the synchronization internally.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::types::{ChannelName, ConnectionId};

/// Table of every connection currently eligible for broadcasts
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under a freshly generated id
    pub fn register(&self, id: ConnectionId, connection: Arc<Connection>) {
        if self.connections.insert(id, connection).is_some() {
            warn!(connection_id = %id, "Connection id registered twice, replaced");
        }
        debug!(connection_id = %id, total = self.connections.len(), "Connection registered");
    }

    /// Register and get a guard that unregisters on drop
    pub fn register_guarded(
        self: &Arc<Self>,
        id: ConnectionId,
        connection: Arc<Connection>,
    ) -> Registration {
        self.register(id, connection);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!(connection_id = %id, total = self.connections.len(), "Connection unregistered");
        }
        removed
    }

    /// Point-in-time copy of all registered connections.
    ///
    /// Shard locks are held only while copying, so the registry stays
    /// writable while the caller delivers to the snapshot.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot restricted to one channel label
    pub fn snapshot_channel(&self, channel: &ChannelName) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().channel() == channel)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Keeps a connection registered for as long as it lives
///
/// Dropping it (normal return, early `?`, or panic unwind) removes the
/// entry, so every exit path of a receive loop deregisters exactly once.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::connection::test_support::*;

    fn connection() -> Arc<Connection> {
        Arc::new(open_connection(null_sink()))
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        let a = connection();
        let b = connection();
        registry.register(a.id(), Arc::clone(&a));
        registry.register(b.id(), Arc::clone(&b));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a.id()));

        assert!(registry.unregister(a.id()).is_some());
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(a.id()));
        assert!(registry.get(b.id()).is_some());
    }

    #[test]
    fn test_unregister_twice_is_noop() {
        let registry = ConnectionRegistry::new();
        let a = connection();
        let b = connection();
        registry.register(a.id(), Arc::clone(&a));
        registry.register(b.id(), Arc::clone(&b));

        assert!(registry.unregister(a.id()).is_some());
        let after_once: HashSet<_> = registry.ids().into_iter().collect();

        assert!(registry.unregister(a.id()).is_none());
        let after_twice: HashSet<_> = registry.ids().into_iter().collect();

        assert_eq!(after_once, after_twice);
        assert_eq!(after_twice, HashSet::from([b.id()]));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = ConnectionRegistry::new();
        let a = connection();
        registry.register(a.id(), Arc::clone(&a));

        let snapshot = registry.snapshot();
        registry.unregister(a.id());
        let late = connection();
        registry.register(late.id(), Arc::clone(&late));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), a.id());
    }

    #[test]
    fn test_snapshot_channel() {
        let registry = ConnectionRegistry::new();
        let a = connection();
        registry.register(a.id(), Arc::clone(&a));

        assert_eq!(registry.snapshot_channel(&ChannelName::from_path("/Default")).len(), 1);
        assert!(registry.snapshot_channel(&ChannelName::from_path("/Other")).is_empty());
    }

    #[test]
    fn test_registration_guard_unregisters_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = connection();
        {
            let guard = registry.register_guarded(a.id(), Arc::clone(&a));
            assert_eq!(guard.id(), a.id());
            assert!(registry.contains(a.id()));
        }
        assert!(!registry.contains(a.id()));
    }

    #[test]
    fn test_registration_guard_survives_panic() {
        let registry = Arc::new(ConnectionRegistry::new());
        let a = connection();
        let id = a.id();

        let reg = Arc::clone(&registry);
        let result = std::thread::spawn(move || {
            let _guard = reg.register_guarded(id, a);
            panic!("receive loop blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!registry.contains(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_unregister_consistency() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                for i in 0..100 {
                    let conn = connection();
                    let id = conn.id();
                    registry.register(id, conn);
                    tokio::task::yield_now().await;
                    if i % 2 == 0 {
                        registry.unregister(id);
                        // Duplicate cleanup from a second exit path
                        registry.unregister(id);
                    } else {
                        kept.push(id);
                    }
                    let _ = registry.snapshot();
                }
                kept
            }));
        }

        let mut expected = HashSet::new();
        for task in tasks {
            expected.extend(task.await.unwrap());
        }

        let actual: HashSet<_> = registry.ids().into_iter().collect();
        assert_eq!(actual.len(), 400);
        assert_eq!(actual, expected);
    }
}
