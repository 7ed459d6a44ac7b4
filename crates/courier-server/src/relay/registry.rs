//! Connection registry: at most one live connection per identity.
//!
//! Registering a second connection for an identity supersedes the first,
//! which is closed before `put` returns. Removal on disconnect is
//! conditional on the connection id so a stale reader can never evict
//! the handle that replaced it.

use super::connection::ConnectionHandle;
use courier_core::{CourierError, CourierResult, Identity};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Map of identity to its live connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Identity, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under its identity, superseding any previous one.
    ///
    /// Returns the superseded handle, already closed.
    pub fn put(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let identity = handle.identity();
        let previous = self.connections.insert(identity, handle.clone());
        match previous {
            Some(old) if !Arc::ptr_eq(&old, &handle) => {
                old.supersede();
                info!(
                    identity = %identity,
                    old_connection = old.id(),
                    new_connection = handle.id(),
                    "connection superseded"
                );
                Some(old)
            }
            _ => {
                debug!(identity = %identity, connection = handle.id(), "connection registered");
                None
            }
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(identity).map(|entry| entry.value().clone())
    }

    /// Like [`get`](Self::get), but a missing receiver is a route miss.
    pub fn require(&self, identity: &Identity) -> CourierResult<Arc<ConnectionHandle>> {
        self.get(identity)
            .ok_or(CourierError::RouteMiss(*identity))
    }

    /// Unconditionally remove the entry for `identity`.
    pub fn remove(&self, identity: &Identity) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(identity).map(|(_, handle)| handle)
    }

    /// Remove `handle`'s entry only if it is still the registered one.
    pub fn release(&self, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(&handle.identity(), |_, current| current.id() == handle.id())
            .is_some();
        if removed {
            debug!(identity = %handle.identity(), connection = handle.id(), "connection released");
        }
        removed
    }

    /// Snapshot of every live handle.
    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(id: u64, identity: Identity) -> (Arc<ConnectionHandle>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ConnectionHandle::new(id, identity, tx)), rx)
    }

    #[test]
    fn put_then_get() {
        let registry = ConnectionRegistry::new();
        let alice = Identity::new_v4();
        let (h, _rx) = handle(1, alice);
        assert!(registry.put(h).is_none());
        assert_eq!(registry.get(&alice).unwrap().id(), 1);
        assert!(registry.get(&Identity::new_v4()).is_none());
        assert!(matches!(
            registry.require(&Identity::new_v4()),
            Err(CourierError::RouteMiss(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn second_put_supersedes_and_closes_first() {
        let registry = ConnectionRegistry::new();
        let alice = Identity::new_v4();
        let (first, _rx1) = handle(1, alice);
        let (second, _rx2) = handle(2, alice);

        registry.put(first.clone());
        let old = registry.put(second.clone()).unwrap();

        assert_eq!(old.id(), 1);
        assert!(first.is_closed());
        assert!(first.was_superseded());
        assert!(!second.is_closed());
        assert_eq!(registry.get(&alice).unwrap().id(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn putting_same_handle_twice_is_not_supersession() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle(1, Identity::new_v4());
        registry.put(h.clone());
        assert!(registry.put(h.clone()).is_none());
        assert!(!h.is_closed());
    }

    #[test]
    fn stale_release_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let alice = Identity::new_v4();
        let (first, _rx1) = handle(1, alice);
        let (second, _rx2) = handle(2, alice);
        registry.put(first.clone());
        registry.put(second.clone());

        assert!(!registry.release(&first));
        assert_eq!(registry.get(&alice).unwrap().id(), 2);

        assert!(registry.release(&second));
        assert!(registry.get(&alice).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn handles_snapshots_all_identities() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = handle(1, Identity::new_v4());
        let (b, _rx2) = handle(2, Identity::new_v4());
        registry.put(a);
        registry.put(b);
        let mut ids: Vec<_> = registry.handles().iter().map(|h| h.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn remove_is_unconditional() {
        let registry = ConnectionRegistry::new();
        let alice = Identity::new_v4();
        let (h, _rx) = handle(1, alice);
        registry.put(h);
        assert_eq!(registry.remove(&alice).unwrap().id(), 1);
        assert!(registry.remove(&alice).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_leave_one_live_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let alice = Identity::new_v4();
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for id in 0..32 {
            let (h, rx) = handle(id, alice);
            handles.push(h);
            receivers.push(rx);
        }

        let tasks: Vec<_> = handles
            .iter()
            .cloned()
            .map(|h| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.put(h);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let live: Vec<_> = handles.iter().filter(|h| !h.is_closed()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(registry.get(&alice).unwrap().id(), live[0].id());
    }
}
