//! Listener Registry
//!
//! Ordered per-cluster listener lists. Dispatch works on a copy of the list so
//! listeners can be added or removed while a message is being delivered.
//!
//! Listeners that joined a running subscription are also queued as pending
//! until the subscription task has called their `on_subscribed` hook.

use crate::domain::ports::{same_listener, EventListenerRef};
use dashmap::DashMap;

/// Concurrent map from cluster name to its listeners, in registration order
#[derive(Default)]
pub struct ListenerRegistry {
    clusters: DashMap<String, Vec<EventListenerRef>>,
    /// Listeners awaiting their `on_subscribed` call
    pending: DashMap<String, Vec<EventListenerRef>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("clusters", &self.clusters.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener, returning the cluster's listener count afterwards
    pub fn add(&self, cluster: &str, listener: EventListenerRef) -> usize {
        let mut listeners = self.clusters.entry(cluster.to_string()).or_default();
        listeners.push(listener);
        listeners.len()
    }

    /// Remove the first registration of `listener`.
    ///
    /// Returns the remaining count, or `None` if the listener was not
    /// registered for the cluster. The cluster entry is dropped once empty.
    pub fn remove(&self, cluster: &str, listener: &EventListenerRef) -> Option<usize> {
        let remaining = {
            let mut listeners = self.clusters.get_mut(cluster)?;
            let pos = listeners.iter().position(|l| same_listener(l, listener))?;
            listeners.remove(pos);
            listeners.len()
        };

        if let Some(mut pending) = self.pending.get_mut(cluster) {
            pending.retain(|l| !same_listener(l, listener));
        }
        if remaining == 0 {
            self.clusters.remove_if(cluster, |_, listeners| listeners.is_empty());
            self.pending.remove(cluster);
        }
        Some(remaining)
    }

    /// Queue a listener for its `on_subscribed` call
    pub fn mark_pending(&self, cluster: &str, listener: EventListenerRef) {
        self.pending.entry(cluster.to_string()).or_default().push(listener);
    }

    /// Take every listener queued for `on_subscribed`, in registration order
    pub fn take_pending(&self, cluster: &str) -> Vec<EventListenerRef> {
        self.pending
            .remove(cluster)
            .map(|(_, pending)| pending)
            .unwrap_or_default()
    }

    /// Copy of the cluster's listeners in registration order
    pub fn listeners(&self, cluster: &str) -> Vec<EventListenerRef> {
        self.clusters
            .get(cluster)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    pub fn count(&self, cluster: &str) -> usize {
        self.clusters.get(cluster).map(|l| l.len()).unwrap_or(0)
    }

    /// Clusters with at least one listener
    pub fn clusters(&self) -> Vec<String> {
        self.clusters.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::EventListener;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Tagged(&'static str);

    #[async_trait]
    impl EventListener for Tagged {
        async fn on_event(&self, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn tagged(tag: &'static str) -> EventListenerRef {
        Arc::new(Tagged(tag))
    }

    #[test]
    fn test_registration_order_preserved() {
        let registry = ListenerRegistry::new();
        let first = tagged("first");
        let second = tagged("second");

        assert_eq!(registry.add("c1", first.clone()), 1);
        assert_eq!(registry.add("c1", second.clone()), 2);

        let listeners = registry.listeners("c1");
        assert!(same_listener(&listeners[0], &first));
        assert!(same_listener(&listeners[1], &second));
    }

    #[test]
    fn test_remove_by_identity() {
        let registry = ListenerRegistry::new();
        let a = tagged("a");
        let b = tagged("b");
        registry.add("c1", a.clone());
        registry.add("c1", b.clone());

        assert_eq!(registry.remove("c1", &a), Some(1));
        assert_eq!(registry.remove("c1", &a), None);
        assert_eq!(registry.count("c1"), 1);

        assert_eq!(registry.remove("c1", &b), Some(0));
        assert!(registry.clusters().is_empty());
    }

    #[test]
    fn test_remove_unknown_cluster() {
        let registry = ListenerRegistry::new();
        assert_eq!(registry.remove("missing", &tagged("x")), None);
        assert!(registry.listeners("missing").is_empty());
    }

    #[test]
    fn test_pending_queue() {
        let registry = ListenerRegistry::new();
        let a = tagged("a");
        let b = tagged("b");
        registry.add("c1", a.clone());
        registry.add("c1", b.clone());
        registry.mark_pending("c1", a.clone());
        registry.mark_pending("c1", b.clone());

        // Removing a listener also drops it from the queue
        registry.remove("c1", &a);
        let pending = registry.take_pending("c1");
        assert_eq!(pending.len(), 1);
        assert!(same_listener(&pending[0], &b));
        assert!(registry.take_pending("c1").is_empty());

        registry.mark_pending("c1", b.clone());
        registry.remove("c1", &b);
        assert!(registry.take_pending("c1").is_empty());
    }

    #[test]
    fn test_listener_copy_is_detached() {
        let registry = ListenerRegistry::new();
        registry.add("c1", tagged("a"));
        let copy = registry.listeners("c1");
        registry.add("c1", tagged("b"));

        assert_eq!(copy.len(), 1);
        assert_eq!(registry.count("c1"), 2);
    }
}
